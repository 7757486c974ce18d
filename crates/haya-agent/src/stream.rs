/// Events emitted during a streaming agent turn.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    Delta { content: String },

    /// The model opened a tool call.
    ToolCallStart { id: String, name: String },

    /// A tool finished; `excerpt` is a short prefix of the result.
    ToolResult { id: String, excerpt: String },

    /// Error surfaced mid-stream.
    Error { message: String },
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        match parse_sse_line("event: content_block_delta") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "content_block_delta"),
            other => panic!("unexpected {other:?}"),
        }
        match parse_sse_line(r#"data: {"x":1}"#) {
            Some(SseParsed::Data(d)) => assert_eq!(d, r#"{"x":1}"#),
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_sse_line(": keepalive").is_none());
    }
}
