use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Remote key layout: `{prefix}{yyyy/mm/dd/HHMMSS}.{format}.{ext}` in UTC.
pub fn object_key(prefix: &str, at: DateTime<Utc>, format: &str, extension: &str) -> String {
    format!(
        "{}{}.{}.{}",
        prefix,
        at.format("%Y/%m/%d/%H%M%S"),
        format,
        extension
    )
}

/// Hands out object keys from the upload time.
///
/// Keys have one-second resolution; two uploads within the same second
/// would overwrite each other, so a key never repeats or goes backwards
/// within a process: a clash moves the timestamp to one second past the
/// previous key.
#[derive(Debug, Clone)]
pub struct ObjectKeyBuilder {
    prefix: String,
    format: String,
    extension: String,
    last: Option<DateTime<Utc>>,
}

impl ObjectKeyBuilder {
    pub fn new(
        prefix: impl Into<String>,
        format: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        ObjectKeyBuilder {
            prefix: prefix.into(),
            format: format.into(),
            extension: extension.into(),
            last: None,
        }
    }

    pub fn next_key(&mut self, now: DateTime<Utc>) -> String {
        let mut at = now.trunc_subsecs(0);
        if let Some(last) = self.last {
            if at <= last {
                at = last + Duration::seconds(1);
            }
        }
        self.last = Some(at);
        object_key(&self.prefix, at, &self.format, &self.extension)
    }
}
