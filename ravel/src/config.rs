use ravel_expr::Endianness;
use serde::{Deserialize, Serialize};

#[cfg(feature = "confy")]
use crate::RavelError;

/// Knobs for the mapper and its memory model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Values deeper than this are stored as `Top`. `None` disables the limit.
    pub complexity: Option<usize>,
    /// Read never-written bytes of a declared region as zero instead of `Top`.
    pub read_uninitialized_as_zero: bool,
    /// Byte order used by [`Mapper::mem`](crate::Mapper::mem).
    pub endianness: Endianness,
    /// Largest disjunction a weak update or a join may produce before giving up to `Top`.
    /// Operators lifted over disjunctions are bounded by [`MAX_VEC`](ravel_expr::MAX_VEC)
    /// instead, which also caps this value.
    pub max_vec: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            complexity: None,
            read_uninitialized_as_zero: false,
            endianness: Endianness::Little,
            max_vec: 16,
        }
    }
}

#[cfg(feature = "confy")]
impl Config {
    pub fn load(app: &str) -> Result<Self, RavelError> {
        Ok(confy::load(app, None)?)
    }

    pub fn store(&self, app: &str) -> Result<(), RavelError> {
        Ok(confy::store(app, None, self.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "complexity": 12, "endianness": "Big" }"#).unwrap();
        assert_eq!(config.complexity, Some(12));
        assert_eq!(config.endianness, ravel_expr::Endianness::Big);
        assert_eq!(config.max_vec, Config::default().max_vec);
        assert!(!config.read_uninitialized_as_zero);
    }
}
