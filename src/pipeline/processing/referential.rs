//! Cross-dataset referential check: reviews and calendar rows must point at a
//! listing that survived cleaning.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{Row, Scalar};
use crate::error::Result;
use crate::pipeline::artifact::ArtifactWriter;

/// What happens to a row whose `listing_id` does not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Discard and count.
    #[default]
    Drop,
    /// Move to the quarantine file and count.
    Quarantine,
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrphanPolicy::Drop => f.write_str("drop"),
            OrphanPolicy::Quarantine => f.write_str("quarantine"),
        }
    }
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(OrphanPolicy::Drop),
            "quarantine" => Ok(OrphanPolicy::Quarantine),
            other => Err(format!("unknown orphan policy '{other}' (expected drop or quarantine)")),
        }
    }
}

/// Listing keys that survived cleaning.
pub type ListingKeys = Arc<HashSet<Scalar>>;

/// Streams child rows through the orphan policy.
pub struct ReferentialFilter {
    fk_index: usize,
    keys: ListingKeys,
    quarantine: Option<ArtifactWriter>,
    orphans: u64,
}

impl ReferentialFilter {
    /// `quarantine` must be set when the policy is [`OrphanPolicy::Quarantine`].
    pub fn new(fk_index: usize, keys: ListingKeys, quarantine: Option<ArtifactWriter>) -> Self {
        Self { fk_index, keys, quarantine, orphans: 0 }
    }

    /// Returns true when the row may be kept. Orphans are counted and, under
    /// quarantine, written to the holding file.
    pub fn admit(&mut self, row: &Row) -> Result<bool> {
        let resolved = match row.get(self.fk_index) {
            Some(Scalar::Null) | None => false,
            Some(fk) => self.keys.contains(fk),
        };
        if resolved {
            return Ok(true);
        }
        self.orphans += 1;
        if let Some(writer) = self.quarantine.as_mut() {
            writer.write_row(row)?;
        }
        Ok(false)
    }

    /// Hands back the pending quarantine writer so it can be committed
    /// together with the dataset's artifact.
    pub fn finish(self) -> (u64, Option<ArtifactWriter>) {
        (self.orphans, self.quarantine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ListingKeys {
        Arc::new([Scalar::Int(1), Scalar::Int(2)].into_iter().collect())
    }

    #[test]
    fn test_drop_policy_counts_orphans() {
        let mut filter = ReferentialFilter::new(1, keys(), None);
        assert!(filter.admit(&vec![Scalar::Int(10), Scalar::Int(1)]).unwrap());
        assert!(!filter.admit(&vec![Scalar::Int(11), Scalar::Int(99)]).unwrap());
        assert!(!filter.admit(&vec![Scalar::Int(12), Scalar::Null]).unwrap());
        let (orphans, quarantine) = filter.finish();
        assert_eq!(orphans, 2);
        assert!(quarantine.is_none());
    }

    #[test]
    fn test_quarantine_policy_writes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reviews_orphans.csv");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.write_header(&["review_id".to_string(), "listing_id".to_string()]).unwrap();

        let mut filter = ReferentialFilter::new(1, keys(), Some(writer));
        assert!(!filter.admit(&vec![Scalar::Int(7), Scalar::Int(42)]).unwrap());
        let (orphans, writer) = filter.finish();
        writer.unwrap().commit().unwrap();

        assert_eq!(orphans, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "review_id,listing_id\n7,42\n");
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Quarantine".parse::<OrphanPolicy>().unwrap(), OrphanPolicy::Quarantine);
        assert!("keep".parse::<OrphanPolicy>().is_err());
    }
}
