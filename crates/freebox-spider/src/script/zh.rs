//! Simplified/Traditional Chinese conversion for the script `s2t` and `t2s`
//! host functions. Word-level, so one-to-many characters follow context.

use zhconv::{zhconv, Variant};

pub fn to_traditional(text: &str) -> String {
    zhconv(text, Variant::ZhHant)
}

pub fn to_simplified(text: &str) -> String {
    zhconv(text, Variant::ZhHans)
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_traditional() {
        assert_eq!(to_traditional("电视剧"), "電視劇");
        assert_eq!(to_traditional("国语 动画 2024"), "國語 動畫 2024");
    }

    #[test]
    fn test_context_dependent_characters() {
        assert_eq!(to_traditional("天干物燥 小心火烛"), "天乾物燥 小心火燭");
    }

    #[test]
    fn test_to_simplified() {
        assert_eq!(to_simplified("電視劇"), "电视剧");
        assert_eq!(to_simplified("綜藝節目"), "综艺节目");
    }

    #[test]
    fn test_non_chinese_passthrough() {
        assert_eq!(to_traditional("abc 123"), "abc 123");
        assert_eq!(to_simplified(""), "");
    }
}
