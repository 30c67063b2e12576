use serde::{de::Error, Deserialize, Deserializer};

use super::Vol;
use crate::Float;

// On-disk form of a volume. Gradients are never persisted.
#[derive(Deserialize)]
#[serde(rename = "Vol", deny_unknown_fields)]
struct StoredVol {
    sx: usize,
    sy: usize,
    depth: usize,
    w: Vec<Float>,
}

impl<'de> Deserialize<'de> for Vol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let StoredVol { sx, sy, depth, w } = StoredVol::deserialize(deserializer)?;

        let n = sx * sy * depth;
        if w.len() != n {
            return Err(D::Error::invalid_length(
                w.len(),
                &format!("{n} values for a {sx}x{sy}x{depth} volume").as_str(),
            ));
        }
        Ok(Vol {
            sx,
            sy,
            depth,
            w,
            dw: vec![0.0; n],
        })
    }
}
