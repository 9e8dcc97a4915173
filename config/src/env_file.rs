//! Parse `KEY=VALUE` env files and upsert single keys in place (atomic replace).

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

/// Minimal env-file parser: lines as KEY=VALUE, skip empty and # comments, trim key and value.
///
/// * Empty value: `KEY=` or `KEY=""` yields key with value `""`.
/// * Comments: only lines starting with `#` (after trim) are skipped; `#` inside value is kept.
/// * Quotes: double-quoted values support `\"` escape; single-quoted values are stripped, no escape.
/// * No multiline or line continuation.
pub fn parse_env(content: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim().to_string();
        let value = v.trim().to_string();
        let value = if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value[1..value.len() - 1].replace("\\\"", "\"")
        } else {
            value
        };
        let value = value
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .map(|s| s.to_string())
            .unwrap_or(value);
        if !key.is_empty() {
            out.insert(key, value);
        }
    }
    out
}

/// Load an env file into a map. Missing file returns an empty map.
pub fn load_env_map(path: &Path) -> std::io::Result<HashMap<String, String>> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(parse_env(&content))
}

/// Replaces the first `KEY=` line with `KEY=value` (appends when the key is absent),
/// writing via a `.tmp` sibling and an atomic rename. Other lines, including
/// comments, are preserved verbatim.
pub fn upsert_env_var(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rows: Vec<String> = if path.exists() {
        std::fs::read_to_string(path)?
            .lines()
            .map(|s| s.to_string())
            .collect()
    } else {
        Vec::new()
    };

    let prefix = format!("{}=", key);
    let mut out: Vec<String> = Vec::with_capacity(rows.len() + 1);
    let mut replaced = false;
    for row in rows {
        if row.starts_with(&prefix) {
            out.push(format!("{}={}", key, value));
            replaced = true;
        } else {
            out.push(row);
        }
    }
    if !replaced {
        out.push(format!("{}={}", key, value));
    }

    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(out.join("\n").trim_end_matches('\n').as_bytes())?;
        f.write_all(b"\n")?;
        f.flush()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let m = parse_env("FOO=bar\nBAZ=quux\n");
        assert_eq!(m.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(m.get("BAZ"), Some(&"quux".to_string()));
    }

    #[test]
    fn skip_comments_and_empty() {
        let m = parse_env("\n# comment\nKEY=val\n  \n");
        assert_eq!(m.get("KEY"), Some(&"val".to_string()));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn quoted_value() {
        let m = parse_env(r#"KEY="hello world""#);
        assert_eq!(m.get("KEY"), Some(&"hello world".to_string()));
    }

    #[test]
    fn single_quoted_value() {
        let m = parse_env("KEY='single quoted'");
        assert_eq!(m.get("KEY"), Some(&"single quoted".to_string()));
    }

    #[test]
    fn line_without_equals_skipped() {
        let m = parse_env("NOT_KEY_VALUE\nKEY=val\n");
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn empty_value_key_equals() {
        let m = parse_env("KEY=\nOTHER=val\n");
        assert_eq!(m.get("KEY"), Some(&"".to_string()));
        assert_eq!(m.get("OTHER"), Some(&"val".to_string()));
    }

    #[test]
    fn escaped_quote_in_double_quoted() {
        let m = parse_env(r#"KEY="say \"hi\"""#);
        assert_eq!(m.get("KEY"), Some(&"say \"hi\"".to_string()));
    }

    #[test]
    fn load_env_map_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let m = load_env_map(&dir.path().join("absent.env")).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn upsert_appends_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram.env");
        upsert_env_var(&path, "TELEGRAM_ALLOW_CHAT_IDS", "12345678").unwrap();
        let m = load_env_map(&path).unwrap();
        assert_eq!(m.get("TELEGRAM_ALLOW_CHAT_IDS"), Some(&"12345678".to_string()));
    }

    #[test]
    fn upsert_replaces_existing_key_and_keeps_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram.env");
        std::fs::write(&path, "# acl seeds\nA=1\nB=2\n").unwrap();
        upsert_env_var(&path, "A", "9").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# acl seeds"));
        assert!(content.contains("A=9"));
        assert!(content.contains("B=2"));
    }

    #[test]
    fn upsert_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/team/telegram.env");
        upsert_env_var(&path, "K", "v").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telegram.env");
        upsert_env_var(&path, "K", "v").unwrap();
        upsert_env_var(&path, "K", "v").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("K=v").count(), 1);
    }
}
