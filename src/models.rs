use serde::{Deserialize, Serialize};

/// Metadata of an uploaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct File {
    pub id: String,
    pub name: String,
    pub size: String,
    #[serde(rename = "SHA256")]
    pub sha256: String,
    pub expire_at: i64,
    pub expire_at_string: String,
    pub downloads_remaining: i32,
    pub password_hash: String,
    pub hotlink_id: String,
    pub content_type: String,
    #[serde(default)]
    pub aws_bucket: String,
}

/// Envelope returned by the API after an upload or info request
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileApiOutput<'a> {
    pub result: &'static str,
    pub file_info: &'a File,
    pub url: String,
    pub hotlink_url: String,
}

/// Error body in the same shape as [`FileApiOutput`]
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorOutput {
    pub result: &'static str,
    pub error_message: String,
}

impl File {
    /// Serializes the file into the API result document.
    ///
    /// `Url` and `HotlinkUrl` are prefixes only; clients append the id or
    /// hotlink id themselves.
    pub fn to_json_result(&self, server_url: &str) -> String {
        let output = FileApiOutput {
            result: "OK",
            file_info: self,
            url: format!("{}d?id=", server_url),
            hotlink_url: format!("{}hotlink/", server_url),
        };
        serde_json::to_string(&output).unwrap_or_else(|e| {
            tracing::error!("Cannot serialize file {}: {}", self.id, e);
            String::new()
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_at <= now || self.downloads_remaining <= 0
    }
}

/// Formats a byte count with SI units, e.g. "10 B" or "1.5 MB"
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1000.0 && unit_idx < UNITS.len() - 1 {
        size /= 1000.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_file() -> File {
        File {
            id: "testId".to_string(),
            name: "testName".to_string(),
            size: "10 B".to_string(),
            sha256: "sha256".to_string(),
            expire_at: 50,
            expire_at_string: "future".to_string(),
            downloads_remaining: 1,
            password_hash: "pwhash".to_string(),
            hotlink_id: "hotlinkid".to_string(),
            content_type: "text/html".to_string(),
            aws_bucket: String::new(),
        }
    }

    #[test]
    fn test_to_json_result() {
        let file = test_file();
        assert_eq!(
            file.to_json_result("serverurl/"),
            r#"{"Result":"OK","FileInfo":{"Id":"testId","Name":"testName","Size":"10 B","SHA256":"sha256","ExpireAt":50,"ExpireAtString":"future","DownloadsRemaining":1,"PasswordHash":"pwhash","HotlinkId":"hotlinkid","ContentType":"text/html","AwsBucket":""},"Url":"serverurl/d?id=","HotlinkUrl":"serverurl/hotlink/"}"#
        );
    }

    #[test]
    fn test_to_json_result_keeps_bucket() {
        let mut file = test_file();
        file.aws_bucket = "gokapi".to_string();
        let json = file.to_json_result("https://example.com/");
        assert!(json.contains(r#""ContentType":"text/html","AwsBucket":"gokapi"}"#));
        assert!(json.ends_with(
            r#""Url":"https://example.com/d?id=","HotlinkUrl":"https://example.com/hotlink/"}"#
        ));
    }

    #[test]
    fn test_file_record_deserializes_without_bucket() {
        let json = r#"{"Id":"a","Name":"b","Size":"1 B","SHA256":"c","ExpireAt":1,"ExpireAtString":"d","DownloadsRemaining":2,"PasswordHash":"","HotlinkId":"","ContentType":"text/plain"}"#;
        let file: File = serde_json::from_str(json).unwrap();
        assert_eq!(file.id, "a");
        assert_eq!(file.downloads_remaining, 2);
        assert_eq!(file.aws_bucket, "");
    }

    #[test]
    fn test_is_expired() {
        let file = test_file();
        assert!(!file.is_expired(49));
        assert!(file.is_expired(50));

        let mut used_up = test_file();
        used_up.downloads_remaining = 0;
        assert!(used_up.is_expired(0));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(10), "10 B");
        assert_eq!(format_size(999), "999 B");
        assert_eq!(format_size(1000), "1.0 kB");
        assert_eq!(format_size(1_500_000), "1.5 MB");
        assert_eq!(format_size(3_210_000_000), "3.2 GB");
    }
}
