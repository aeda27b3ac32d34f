use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigParseError {
    #[error("user-data line {line} does not conform to key=value: '{content}'")]
    MalformedLine { line: usize, content: String },

    #[error("unknown action '{tag}'")]
    UnknownAction { tag: String },
}

/// User-supplied `key=value` configuration.
///
/// Repeated keys accumulate in order. Keys in use: `provide`, `subscribe`,
/// `action`, `local_name`, `public_name`, `pre_script`, `post_script` and
/// `disable`.
#[derive(Debug, Clone, Default)]
pub struct UserData {
    entries: Vec<(String, Vec<String>)>,
}

impl UserData {
    /// Parse user data, skipping malformed lines with a warning
    pub fn parse(text: &str) -> Self {
        let (data, errors) = Self::parse_lenient(text);
        for err in errors {
            tracing::warn!("{}", err);
        }
        data
    }

    /// Parse user data, returning every malformed line alongside the result
    pub fn parse_lenient(text: &str) -> (Self, Vec<ConfigParseError>) {
        let mut data = Self::default();
        let mut errors = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    // further '=' signs are dropped from the value
                    data.push(key, value.replace('=', ""));
                }
                _ => errors.push(ConfigParseError::MalformedLine {
                    line: idx + 1,
                    content: line.to_string(),
                }),
            }
        }

        (data, errors)
    }

    fn push(&mut self, key: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key.to_string(), vec![value])),
        }
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// Every value for `key`, in order of appearance
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// Values for `key` with empty entries removed
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get_all(key)
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// True when the first value for `key` is non-empty. `key=` alone
    /// counts as unset.
    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).map_or(false, |v| !v.trim().is_empty())
    }
}
