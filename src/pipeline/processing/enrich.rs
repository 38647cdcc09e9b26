//! Dataset-wide derivations that need every cleaned row before they can be
//! computed.

use serde::{Deserialize, Serialize};

use crate::domain::Scalar;

/// Quartile cut points of listing prices, used to derive `price_category`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBands {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

impl PriceBands {
    /// Quartiles with linear interpolation between closest ranks.
    /// Returns `None` when no price is known.
    pub fn from_prices(mut prices: Vec<f64>) -> Option<Self> {
        prices.retain(|p| p.is_finite());
        if prices.is_empty() {
            return None;
        }
        prices.sort_by(f64::total_cmp);
        Some(Self {
            p25: quantile(&prices, 0.25),
            p50: quantile(&prices, 0.50),
            p75: quantile(&prices, 0.75),
        })
    }

    pub fn classify(&self, price: &Scalar) -> Scalar {
        let Some(p) = price.as_f64() else {
            return Scalar::Null;
        };
        let label = if p <= self.p25 {
            "budget"
        } else if p <= self.p50 {
            "moderate"
        } else if p <= self.p75 {
            "expensive"
        } else {
            "luxury"
        };
        Scalar::Text(label.to_string())
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = (sorted.len() - 1) as f64 * q;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let weight = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}
