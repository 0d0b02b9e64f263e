use serde::{Deserialize, Serialize};

use super::transport::{DecodeSnafu, TransportResult};

/// Body encoding used by the streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// Raw UTF-8 text; every decoded piece is a delta.
    #[default]
    Text,
    /// Newline-delimited `CODE:JSON` parts (`0:"text"`, `3:"error"`, `d:{..}`).
    DataStream,
}

impl WireFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "data-stream" | "data" => Some(Self::DataStream),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::DataStream => "data-stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedPart {
    Text(String),
    Error(String),
    Finish,
}

/// Incremental decoder for one response body.
///
/// Network chunks may split UTF-8 sequences and data-stream lines anywhere, so
/// incomplete tails are buffered until the next `push` or `finish`.
#[derive(Debug)]
pub struct ChunkDecoder {
    format: WireFormat,
    pending_bytes: Vec<u8>,
    pending_line: String,
}

impl ChunkDecoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            pending_bytes: Vec::new(),
            pending_line: String::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> TransportResult<Vec<DecodedPart>> {
        self.pending_bytes.extend_from_slice(bytes);
        let text = self.take_valid_utf8()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }

        match self.format {
            WireFormat::Text => Ok(vec![DecodedPart::Text(text)]),
            WireFormat::DataStream => {
                self.pending_line.push_str(&text);
                self.drain_complete_lines()
            }
        }
    }

    pub fn finish(mut self) -> TransportResult<Vec<DecodedPart>> {
        if !self.pending_bytes.is_empty() {
            return DecodeSnafu {
                stage: "finish-utf8",
                details: format!(
                    "stream ended inside a {}-byte UTF-8 sequence",
                    self.pending_bytes.len()
                ),
            }
            .fail();
        }

        match self.format {
            WireFormat::Text => Ok(Vec::new()),
            WireFormat::DataStream => {
                let line = std::mem::take(&mut self.pending_line);
                Ok(parse_data_line(&line)?.into_iter().collect())
            }
        }
    }

    fn take_valid_utf8(&mut self) -> TransportResult<String> {
        let valid_up_to = match std::str::from_utf8(&self.pending_bytes) {
            Ok(_) => self.pending_bytes.len(),
            Err(error) => {
                if error.error_len().is_some() {
                    return DecodeSnafu {
                        stage: "decode-utf8",
                        details: format!("invalid UTF-8 at byte {}", error.valid_up_to()),
                    }
                    .fail();
                }
                error.valid_up_to()
            }
        };

        let tail = self.pending_bytes.split_off(valid_up_to);
        let head = std::mem::replace(&mut self.pending_bytes, tail);
        // The prefix was validated above.
        Ok(String::from_utf8(head).unwrap_or_default())
    }

    fn drain_complete_lines(&mut self) -> TransportResult<Vec<DecodedPart>> {
        let mut parts = Vec::new();
        while let Some(line_end) = self.pending_line.find('\n') {
            let line = self.pending_line[..line_end].to_string();
            self.pending_line.drain(..=line_end);
            if let Some(part) = parse_data_line(&line)? {
                parts.push(part);
            }
        }
        Ok(parts)
    }
}

fn parse_data_line(line: &str) -> TransportResult<Option<DecodedPart>> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return Ok(None);
    }

    let Some((code, payload)) = line.split_once(':') else {
        return DecodeSnafu {
            stage: "split-data-line",
            details: format!("missing part code in line '{line}'"),
        }
        .fail();
    };

    match code {
        "0" => parse_string_payload(code, payload).map(|text| Some(DecodedPart::Text(text))),
        "3" => parse_string_payload(code, payload).map(|message| Some(DecodedPart::Error(message))),
        "d" => {
            if serde_json::from_str::<serde_json::Value>(payload).is_err() {
                return DecodeSnafu {
                    stage: "parse-finish-part",
                    details: format!("finish part is not JSON: '{payload}'"),
                }
                .fail();
            }
            Ok(Some(DecodedPart::Finish))
        }
        // Tool calls, annotations, step markers and other parts carry no transcript text.
        _ => Ok(None),
    }
}

fn parse_string_payload(code: &str, payload: &str) -> TransportResult<String> {
    serde_json::from_str::<String>(payload).map_err(|error| {
        DecodeSnafu {
            stage: "parse-string-part",
            details: format!("part '{code}' payload is not a JSON string: {error}"),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_decoder_reassembles_split_multibyte_characters() {
        let bytes = "héllo".as_bytes();
        let mut decoder = ChunkDecoder::new(WireFormat::Text);

        let first = decoder.push(&bytes[..2]).unwrap();
        let second = decoder.push(&bytes[2..]).unwrap();

        assert_eq!(first, vec![DecodedPart::Text("h".to_string())]);
        assert_eq!(second, vec![DecodedPart::Text("éllo".to_string())]);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn text_decoder_rejects_invalid_utf8() {
        let mut decoder = ChunkDecoder::new(WireFormat::Text);
        assert!(decoder.push(&[b'a', 0xff, b'b']).is_err());
    }

    #[test]
    fn text_decoder_rejects_truncated_tail_at_end_of_stream() {
        let mut decoder = ChunkDecoder::new(WireFormat::Text);
        let bytes = "é".as_bytes();
        assert!(decoder.push(&bytes[..1]).unwrap().is_empty());
        assert!(decoder.finish().is_err());
    }

    #[test]
    fn data_stream_decoder_handles_lines_split_across_chunks() {
        let mut decoder = ChunkDecoder::new(WireFormat::DataStream);

        let first = decoder.push(b"0:\"Hel").unwrap();
        let second = decoder.push(b"\"\n0:\"lo\"\n").unwrap();
        let third = decoder
            .push(b"e:{\"finishReason\":\"stop\"}\nd:{\"finishReason\":\"stop\"}\n")
            .unwrap();

        assert!(first.is_empty());
        assert_eq!(
            second,
            vec![
                DecodedPart::Text("Hel".to_string()),
                DecodedPart::Text("lo".to_string())
            ]
        );
        assert_eq!(third, vec![DecodedPart::Finish]);
    }

    #[test]
    fn data_stream_decoder_surfaces_error_parts() {
        let mut decoder = ChunkDecoder::new(WireFormat::DataStream);
        let parts = decoder.push(b"3:\"rate limited\"\n").unwrap();
        assert_eq!(parts, vec![DecodedPart::Error("rate limited".to_string())]);
    }

    #[test]
    fn data_stream_decoder_flushes_unterminated_last_line() {
        let mut decoder = ChunkDecoder::new(WireFormat::DataStream);
        assert!(decoder.push(b"0:\"tail\"").unwrap().is_empty());
        assert_eq!(
            decoder.finish().unwrap(),
            vec![DecodedPart::Text("tail".to_string())]
        );
    }

    #[test]
    fn data_stream_decoder_rejects_malformed_lines() {
        let mut decoder = ChunkDecoder::new(WireFormat::DataStream);
        assert!(decoder.push(b"no part code here\n").is_err());

        let mut decoder = ChunkDecoder::new(WireFormat::DataStream);
        assert!(decoder.push(b"0:not-json\n").is_err());
    }

    #[test]
    fn wire_format_parses_aliases() {
        assert_eq!(WireFormat::parse("TEXT"), Some(WireFormat::Text));
        assert_eq!(WireFormat::parse("data"), Some(WireFormat::DataStream));
        assert_eq!(WireFormat::parse(" data-stream "), Some(WireFormat::DataStream));
        assert_eq!(WireFormat::parse("sse"), None);
    }
}
