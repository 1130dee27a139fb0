use env_logger::{Builder, WriteStyle};
use log::{info, warn, LevelFilter};
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;

/// Initialize logging to stderr, or to `log_file` when one is given
pub fn initialize_logging(
    level: &str,
    log_file: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let level = LevelFilter::from_str(level)?;

    let mut builder = Builder::new();
    builder
        .filter_level(level)
        .format_timestamp_secs()
        .format_module_path(true)
        .write_style(WriteStyle::Auto);

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;

    info!("Logging system initialized at level {}", level);
    Ok(())
}

/// Mask an identifier so log lines stay correlatable without exposing it
pub fn format_sensitive(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Structured line for every authentication outcome
pub fn log_auth_event(event_type: &str, who: &str, success: bool, details: Option<&str>) {
    if success {
        info!(
            "Auth event: type={}, who={}, success=true, details={:?}",
            event_type,
            format_sensitive(who),
            details
        );
    } else {
        warn!(
            "Auth event: type={}, who={}, success=false, details={:?}",
            event_type,
            format_sensitive(who),
            details
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sensitive_data_formatting() {
        assert_eq!(format_sensitive("password"), "pa***rd");
        assert_eq!(format_sensitive("key"), "***");
        assert_eq!(format_sensitive("u1@example.com"), "u1***om");
        assert_eq!(format_sensitive(""), "");
        assert_eq!(format_sensitive("éèàùç"), "éè***ùç");
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(initialize_logging("loud", None).is_err());
    }

    #[test]
    fn test_logging_initialization() {
        let log_file = NamedTempFile::new().unwrap();

        // A second logger in the same test binary reports "already initialized"
        let result = initialize_logging("info", Some(log_file.path()));
        assert!(
            result.is_ok()
                || result
                    .unwrap_err()
                    .to_string()
                    .contains("already")
        );

        log_auth_event("login", "u1@example.com", true, None);
        log_auth_event("login", "u1@example.com", false, Some("credential mismatch"));
    }
}
