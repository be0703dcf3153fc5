//! Incremental extraction of concatenated JSON objects from streamed text
//!
//! Models emitting structured output inline write objects back to back with
//! no separator, wrapped in prose or code fences, and split across arbitrary
//! chunk boundaries. The scanner tracks candidate objects outside string
//! literals (honouring escapes) and hands back every complete top-level
//! object plus the unfinished tail to carry into the next chunk. Stray
//! braces in surrounding prose never swallow the objects that follow.

use serde_json::Value;
use tracing::debug;

/// Extract every complete top-level JSON object from `buffer`.
///
/// Returns the parsed objects in order and the remainder that still needs
/// more input (an object whose closing brace has not arrived yet). Text
/// outside objects is dropped, and balanced spans that fail to parse are
/// rescanned from the character after their opening brace.
pub fn extract_json_objects(buffer: &str) -> (Vec<Value>, String) {
    let mut scanner = StreamScanner::new();
    let objects = scanner.push(buffer);
    (objects, scanner.buffer)
}

/// Resumable scanner that owns the carry-over buffer between chunks
///
/// Scan state survives across pushes, so each byte is examined once unless
/// a balanced span fails to parse. A `{` only stays a candidate while what
/// follows could still be JSON: the next significant character must be a
/// key quote or `}`, and a nested `{` must sit in value position. Anything
/// else marks the open candidates as prose and scanning resumes there.
#[derive(Debug, Default)]
pub struct StreamScanner {
    buffer: String,
    /// Next byte offset in `buffer` to examine
    pos: usize,
    /// Start offsets of open candidates, outermost first
    open: Vec<usize>,
    in_string: bool,
    escaped: bool,
    /// Last significant character inside a candidate, outside strings
    last: Option<char>,
}

impl StreamScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every object it completed
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buffer.push_str(chunk);
        let mut objects = Vec::new();

        while let Some(c) = self.buffer[self.pos..].chars().next() {
            let i = self.pos;
            self.pos += c.len_utf8();

            if self.open.is_empty() {
                if c == '{' {
                    self.open_candidate(i);
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                    self.last = Some('"');
                }
                continue;
            }

            if c.is_whitespace() {
                continue;
            }

            // Every `{` must be followed by a key or `}`
            if self.last == Some('{') && c != '"' && c != '}' {
                self.reset();
                self.pos = i;
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' => {
                    if !matches!(self.last, Some(':' | ',' | '[')) {
                        // Not in value position, so the enclosing text is prose
                        self.reset();
                    }
                    self.open_candidate(i);
                    continue;
                }
                '}' => {
                    if let Some(start) = self.open.pop() {
                        if self.open.is_empty() {
                            let candidate = &self.buffer[start..self.pos];
                            match serde_json::from_str::<Value>(candidate) {
                                Ok(value) if value.is_object() => objects.push(value),
                                Ok(_) => {}
                                Err(e) => {
                                    debug!("Rescanning after malformed JSON object: {}", e);
                                    self.reset();
                                    self.pos = start + 1;
                                    continue;
                                }
                            }
                            self.reset();
                            continue;
                        }
                    }
                }
                _ => {}
            }
            self.last = Some(c);
        }

        self.compact();
        objects
    }

    /// Text still waiting for a closing brace
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn open_candidate(&mut self, start: usize) {
        self.open.push(start);
        self.last = Some('{');
    }

    fn reset(&mut self) {
        self.open.clear();
        self.in_string = false;
        self.escaped = false;
        self.last = None;
    }

    /// Drop everything before the outermost open candidate
    fn compact(&mut self) {
        let keep_from = self.open.first().copied().unwrap_or(self.pos);
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.pos -= keep_from;
        for start in &mut self.open {
            *start -= keep_from;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_back_to_back_objects() {
        let (objects, rest) = extract_json_objects(r#"{"a":1}{"b":2}"#);
        assert_eq!(objects, vec![json!({"a": 1}), json!({"b": 2})]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let (objects, rest) = extract_json_objects(r#"{"thought":"use { and } freely"}"#);
        assert_eq!(objects, vec![json!({"thought": "use { and } freely"})]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let (objects, _) = extract_json_objects(r#"{"t":"say \"hi}\" now"}"#);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["t"], "say \"hi}\" now");
    }

    #[test]
    fn test_escaped_backslash_before_quote() {
        let (objects, rest) = extract_json_objects(r#"{"path":"C:\\"}{"next":true}"#);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0]["path"], "C:\\");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_incomplete_tail_is_returned() {
        let (objects, rest) = extract_json_objects(r#"{"a":1}{"to"#);
        assert_eq!(objects, vec![json!({"a": 1})]);
        assert_eq!(rest, r#"{"to"#);
    }

    #[test]
    fn test_prose_and_fences_dropped() {
        let text = "Sure! ```json\n{\"final_response\":\"done\"}\n``` hope that helps";
        let (objects, rest) = extract_json_objects(text);
        assert_eq!(objects, vec![json!({"final_response": "done"})]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_malformed_object_skipped() {
        let (objects, _) = extract_json_objects(r#"{not json}{"ok":true}"#);
        assert_eq!(objects, vec![json!({"ok": true})]);
    }

    #[test]
    fn test_nested_objects_stay_whole() {
        let (objects, _) = extract_json_objects(r#"{"tool":"t1","args":{"x":{"y":1}}}"#);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["args"]["x"]["y"], 1);
    }

    #[test]
    fn test_scanner_split_mid_object() {
        let mut scanner = StreamScanner::new();

        let first = scanner.push(r#"{"thought":"a"}"#);
        assert_eq!(first, vec![json!({"thought": "a"})]);

        let second = scanner.push(r#"{"to"#);
        assert!(second.is_empty());
        assert_eq!(scanner.pending(), r#"{"to"#);

        let third = scanner.push(r#"ol":"t1","args":{}}"#);
        assert_eq!(third, vec![json!({"tool": "t1", "args": {}})]);
        assert!(scanner.pending().is_empty());
    }

    #[test]
    fn test_scanner_split_inside_string_with_brace() {
        let mut scanner = StreamScanner::new();
        assert!(scanner.push(r#"{"thought":"open {"#).is_empty());
        let done = scanner.push(r#" still string"}"#);
        assert_eq!(done, vec![json!({"thought": "open { still string"})]);
    }

    #[test]
    fn test_unicode_text_around_objects() {
        let (objects, _) = extract_json_objects("héllo → {\"k\":\"ü\"} ✓");
        assert_eq!(objects, vec![json!({"k": "ü"})]);
    }

    #[test]
    fn test_stray_prose_brace_does_not_hide_later_step() {
        let mut scanner = StreamScanner::new();
        assert!(scanner.push("Thinking about set { of items. ").is_empty());
        assert!(scanner.pending().is_empty());

        let steps = scanner.push(r#"{"final_response":"done"}"#);
        assert_eq!(steps, vec![json!({"final_response": "done"})]);
    }

    #[test]
    fn test_stray_brace_before_key_quote() {
        let (objects, rest) =
            extract_json_objects(r#"Note {"x" is odd. {"thought":"a"}{"tool":"t1","args":{}}"#);
        assert_eq!(
            objects,
            vec![json!({"thought": "a"}), json!({"tool": "t1", "args": {}})]
        );
        assert!(rest.is_empty());
    }

    #[test]
    fn test_unbalanced_malformed_span_rescanned() {
        let (objects, _) = extract_json_objects(r#"{"a": nope, "b": {"c":1}}"#);
        assert_eq!(objects, vec![json!({"c": 1})]);
    }

    #[test]
    fn test_objects_inside_arrays_stay_whole() {
        let (objects, _) = extract_json_objects(r#"{"items":[{"a":1},{"b":2}]}"#);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["items"][1]["b"], 2);
    }

    #[test]
    fn test_char_by_char_matches_whole_buffer() {
        let text = "Plan: {\"thought\":\"split } here\"} then {\"tool\":\"t1\",\"args\":{\"q\":[1,{\"r\":\"é\"}]}}";
        let (whole, _) = extract_json_objects(text);

        let mut scanner = StreamScanner::new();
        let mut pieces = Vec::new();
        for c in text.chars() {
            pieces.extend(scanner.push(&c.to_string()));
        }
        assert_eq!(pieces, whole);
        assert_eq!(pieces.len(), 2);
        assert!(scanner.pending().is_empty());
    }

    #[test]
    fn test_pending_keeps_only_open_candidate() {
        let mut scanner = StreamScanner::new();
        scanner.push(r#"lots of prose first {"final_response":"par"#);
        assert_eq!(scanner.pending(), r#"{"final_response":"par"#);
        let done = scanner.push(r#"tial"}"#);
        assert_eq!(done, vec![json!({"final_response": "partial"})]);
    }
}
