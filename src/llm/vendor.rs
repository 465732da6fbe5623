//! Vendor tool-call sentinel handling
//!
//! Some OpenAI-compatible endpoints embed tool calls as textual sentinel
//! markers inside normal text instead of first-class function-call parts.
//! At final-message assembly the markers are lifted into synthetic
//! function calls and removed from the visible text. Delta events are
//! never rewritten; consumers briefly see the raw sentinel and stop
//! receiving it once the turn concludes.

use serde_json::Value;

pub const TOOL_CALL_BEGIN: &str = "<|tool_call_begin|>";
pub const TOOL_CALL_SEP: &str = "<|tool_call_sep|>";
pub const TOOL_CALL_END: &str = "<|tool_call_end|>";

#[derive(Debug, Clone, PartialEq)]
pub struct VendorToolCall {
    pub name: String,
    pub args: Value,
}

/// Extract every sentinel-marked tool call and return the text with the
/// markers removed. An unterminated marker is left in place verbatim.
pub fn parse_vendor_tool_calls(text: &str) -> (Vec<VendorToolCall>, String) {
    let mut calls = Vec::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let Some(begin) = rest.find(TOOL_CALL_BEGIN) else {
            cleaned.push_str(rest);
            break;
        };
        cleaned.push_str(&rest[..begin]);
        let after_begin = &rest[begin + TOOL_CALL_BEGIN.len()..];

        let Some(end) = after_begin.find(TOOL_CALL_END) else {
            // No terminator: keep the tail untouched
            cleaned.push_str(&rest[begin..]);
            break;
        };
        let body = &after_begin[..end];
        let (name, args) = match body.find(TOOL_CALL_SEP) {
            Some(sep) => (
                body[..sep].trim(),
                parse_args(&body[sep + TOOL_CALL_SEP.len()..]),
            ),
            None => (body.trim(), Value::Object(Default::default())),
        };
        if !name.is_empty() {
            calls.push(VendorToolCall {
                name: name.to_string(),
                args,
            });
        }
        rest = &after_begin[end + TOOL_CALL_END.len()..];
    }

    (calls, cleaned)
}

/// Strip sentinel markers from text, discarding the lifted calls
pub fn filter_vendor_markers(text: &str) -> String {
    parse_vendor_tool_calls(text).1
}

fn parse_args(raw: &str) -> Value {
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_untouched() {
        let (calls, text) = parse_vendor_tool_calls("今天适合观望。");
        assert!(calls.is_empty());
        assert_eq!(text, "今天适合观望。");
    }

    #[test]
    fn test_lift_single_call() {
        let input = format!(
            "先看数据{}get_kline_data{}{{\"code\":\"sh600519\"}}{}再说",
            TOOL_CALL_BEGIN, TOOL_CALL_SEP, TOOL_CALL_END
        );
        let (calls, text) = parse_vendor_tool_calls(&input);
        assert_eq!(text, "先看数据再说");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_kline_data");
        assert_eq!(calls[0].args, json!({"code": "sh600519"}));
    }

    #[test]
    fn test_lift_multiple_calls_in_order() {
        let input = format!(
            "{}a{}{{}}{}{}b{}{{}}{}",
            TOOL_CALL_BEGIN,
            TOOL_CALL_SEP,
            TOOL_CALL_END,
            TOOL_CALL_BEGIN,
            TOOL_CALL_SEP,
            TOOL_CALL_END
        );
        let (calls, text) = parse_vendor_tool_calls(&input);
        assert_eq!(text, "");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
    }

    #[test]
    fn test_unterminated_marker_kept() {
        let input = format!("正常文本{}get_news", TOOL_CALL_BEGIN);
        let (calls, text) = parse_vendor_tool_calls(&input);
        assert!(calls.is_empty());
        assert_eq!(text, input);
    }

    #[test]
    fn test_bad_args_become_empty_object() {
        let input = format!(
            "{}tool{}not json{}",
            TOOL_CALL_BEGIN, TOOL_CALL_SEP, TOOL_CALL_END
        );
        let (calls, text) = parse_vendor_tool_calls(&input);
        assert_eq!(text, "");
        assert_eq!(calls[0].args, json!({}));
    }

    #[test]
    fn test_filter_is_the_cleaned_text() {
        let input = format!(
            "保留{}t{}{{}}{}这里",
            TOOL_CALL_BEGIN, TOOL_CALL_SEP, TOOL_CALL_END
        );
        assert_eq!(filter_vendor_markers(&input), "保留这里");
    }
}
