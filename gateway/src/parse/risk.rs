//! High-risk prompt detection: regex markers plus a bilingual keyword list.
//! Returns a non-empty risk tag on the first match, else an empty string.

use once_cell::sync::Lazy;
use regex::Regex;

static REGEX_MARKERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\brm\s+-rf\b", "destructive_delete"),
        (r"\bmkfs(\.| )", "filesystem_format"),
        (r"\bdd\s+if=", "raw_disk_write"),
        (r"\bshutdown\b", "shutdown"),
        (r"\breboot\b", "reboot"),
        (r"\bpoweroff\b", "poweroff"),
        (r"\bdrop\s+database\b", "drop_database"),
        (r"\btruncate\s+table\b", "truncate_table"),
        (r"\bdelete\s+from\b", "sql_delete"),
        (r"\bvisudo\b", "sudoers_edit"),
    ]
    .iter()
    .map(|(pat, tag)| (Regex::new(pat).expect("static risk pattern"), *tag))
    .collect()
});

const KEYWORD_MARKERS: &[(&str, &str)] = &[
    ("delete all", "delete_all"),
    ("format disk", "format_disk"),
    ("factory reset", "factory_reset"),
    ("wipe", "wipe"),
    ("초기화", "k_reset"),
    ("포맷", "k_format"),
    ("전부 삭제", "k_delete_all"),
    ("전체 삭제", "k_delete_all"),
    ("데이터 삭제", "k_delete_data"),
    ("재부팅", "k_reboot"),
];

pub fn detect_high_risk_prompt(prompt: &str) -> String {
    let text = prompt.trim();
    if text.is_empty() {
        return String::new();
    }
    let low = text.to_lowercase();

    for (pattern, tag) in REGEX_MARKERS.iter() {
        if pattern.is_match(&low) {
            return (*tag).to_string();
        }
    }
    for (token, tag) in KEYWORD_MARKERS {
        if low.contains(token) {
            return (*tag).to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rm_rf_is_destructive_delete() {
        assert_eq!(detect_high_risk_prompt("rm -rf /tmp/demo"), "destructive_delete");
        assert_eq!(detect_high_risk_prompt("please RM -RF /srv"), "destructive_delete");
    }

    #[test]
    fn sql_and_disk_markers() {
        assert_eq!(detect_high_risk_prompt("drop database prod"), "drop_database");
        assert_eq!(detect_high_risk_prompt("dd if=/dev/zero of=/dev/sda"), "raw_disk_write");
        assert_eq!(detect_high_risk_prompt("delete from users"), "sql_delete");
    }

    #[test]
    fn korean_keywords() {
        assert_eq!(detect_high_risk_prompt("디스크 포맷 부탁"), "k_format");
        assert_eq!(detect_high_risk_prompt("전체 삭제 해줘"), "k_delete_all");
    }

    #[test]
    fn benign_prompt_is_empty() {
        assert_eq!(detect_high_risk_prompt("결측치 규칙 정리해줘"), "");
        assert_eq!(detect_high_risk_prompt(""), "");
    }

    #[test]
    fn regex_markers_win_over_keywords() {
        // "rm -rf" appears before "wipe" in evaluation order.
        assert_eq!(detect_high_risk_prompt("wipe it with rm -rf /"), "destructive_delete");
    }
}
