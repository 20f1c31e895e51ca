//! Execution options.

use url::Url;

use crate::error::Error;

/// Options for connections, cursors and pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Buffered rows at which a cursor asks its producer to pause.
    ///
    /// Default: `128`
    pub cursor_pause_count: usize,

    /// Buffered rows at which a paused cursor asks its producer to resume.
    ///
    /// Default: `32`
    pub cursor_resume_count: usize,

    /// Maximum number of idle connections in the pool.
    ///
    /// Default: `100`
    pub pool_max_idle_conn: usize,

    /// Maximum number of concurrent connections (None = unlimited).
    ///
    /// Default: `None`
    pub pool_max_concurrency: Option<usize>,

    /// Parameters passed through to the driver adapter.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            cursor_pause_count: 128,
            cursor_resume_count: 32,
            pool_max_idle_conn: 100,
            pool_max_concurrency: None,
            params: Vec::new(),
        }
    }
}

impl Opts {
    /// Check the cursor thresholds.
    pub fn validate(&self) -> Result<(), Error> {
        if self.cursor_pause_count == 0 {
            return Err(Error::InvalidUsage(
                "cursor_pause_count must be at least 1".into(),
            ));
        }
        if self.cursor_resume_count > self.cursor_pause_count {
            return Err(Error::InvalidUsage(format!(
                "cursor_resume_count ({}) must not exceed cursor_pause_count ({})",
                self.cursor_resume_count, self.cursor_pause_count
            )));
        }
        Ok(())
    }

    /// Look up a pass-through parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidUsage(format!("Invalid {}: {}", key, value)))
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Read options from the query string of a URL.
    ///
    /// Format: `scheme://[...][?param1=value1&param2=value2&..]`
    ///
    /// Recognized query parameters:
    /// - `cursor_pause_count`: positive integer
    /// - `cursor_resume_count`: integer, not larger than `cursor_pause_count`
    /// - `pool_max_idle_conn`: maximum idle connections
    /// - `pool_max_concurrency`: maximum concurrent connections
    ///
    /// Every other pair is kept in `params` for the driver adapter.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        let mut opts = Opts::default();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "cursor_pause_count" => {
                    opts.cursor_pause_count = parse_count(&key, &value)?;
                }
                "cursor_resume_count" => {
                    opts.cursor_resume_count = parse_count(&key, &value)?;
                }
                "pool_max_idle_conn" => {
                    opts.pool_max_idle_conn = parse_count(&key, &value)?;
                }
                "pool_max_concurrency" => {
                    opts.pool_max_concurrency = Some(parse_count(&key, &value)?);
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        opts.validate()?;
        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Opts::try_from("mem://local").unwrap();
        assert_eq!(opts, Opts::default());
        assert_eq!(opts.cursor_pause_count, 128);
        assert_eq!(opts.cursor_resume_count, 32);
    }

    #[test]
    fn test_query_pairs() {
        let opts = Opts::try_from(
            "pg://u@h/db?cursor_pause_count=8&cursor_resume_count=2&pool_max_concurrency=4&sslmode=require",
        )
        .unwrap();
        assert_eq!(opts.cursor_pause_count, 8);
        assert_eq!(opts.cursor_resume_count, 2);
        assert_eq!(opts.pool_max_concurrency, Some(4));
        assert_eq!(opts.param("sslmode"), Some("require"));
        assert_eq!(opts.param("missing"), None);
    }

    #[test]
    fn test_invalid_thresholds() {
        assert!(matches!(
            Opts::try_from("mem://x?cursor_pause_count=2&cursor_resume_count=3"),
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            Opts::try_from("mem://x?cursor_pause_count=0&cursor_resume_count=0"),
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            Opts::try_from("mem://x?pool_max_idle_conn=lots"),
            Err(Error::InvalidUsage(_))
        ));
        assert!(Opts::try_from("not a url").is_err());
    }
}
