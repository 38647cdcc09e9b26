// Row-level processing: shape normalization, cleaning, derivations and the
// cross-dataset referential check

pub mod clean;
pub mod enrich;
pub mod normalize;
pub mod referential;
