//! Demultiplexing of a session's output stream
//!
//! The remote side writes, in order: the command's live output, a newline,
//! a separator line `<token>:<status>`, and a trailing tar archive. The
//! newline before the separator line belongs to the framing, so output that
//! does not end in a newline still comes through byte for byte.

/// How the stream ended
#[derive(Debug, PartialEq, Eq)]
pub enum DemuxEnd {
    /// The separator was seen
    Complete {
        /// Exit status of the command, as reported in the separator line
        status: i32,
        /// Everything after the separator line
        trailer: Vec<u8>,
    },
    /// The stream ended without a separator; `unflushed` is output that was
    /// still held back and belongs to the caller
    Truncated { unflushed: Vec<u8> },
}

/// Splits live output from the trailing archive
#[derive(Debug)]
pub struct SeparatorDemux {
    separator: Vec<u8>,
    pending: Vec<u8>,
    held_newline: bool,
    at_line_start: bool,
    status: Option<i32>,
    trailer: Vec<u8>,
}

impl SeparatorDemux {
    pub fn new(separator: &str) -> Self {
        Self {
            separator: separator.as_bytes().to_vec(),
            pending: Vec::new(),
            held_newline: false,
            at_line_start: true,
            status: None,
            trailer: Vec::new(),
        }
    }

    /// True once the separator line has been consumed
    pub fn separator_seen(&self) -> bool {
        self.status.is_some()
    }

    /// Feed a chunk of the stream; returns the output that can be forwarded now.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if self.status.is_some() {
            self.trailer.extend_from_slice(chunk);
            return out;
        }
        self.pending.extend_from_slice(chunk);

        while self.status.is_none() {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let body = &line[..line.len() - 1];

            if self.at_line_start {
                if let Some(status) = self.parse_separator(body) {
                    self.status = Some(status);
                    self.held_newline = false;
                    self.trailer.append(&mut self.pending);
                    break;
                }
            }
            if self.held_newline {
                out.push(b'\n');
            }
            out.extend_from_slice(body);
            self.held_newline = true;
            self.at_line_start = true;
        }

        // Forward a partial line early unless it could still turn into the separator.
        if self.status.is_none()
            && !self.pending.is_empty()
            && !(self.at_line_start && self.could_be_separator(&self.pending))
        {
            if self.held_newline {
                out.push(b'\n');
                self.held_newline = false;
            }
            out.append(&mut self.pending);
            self.at_line_start = false;
        }
        out
    }

    /// Close the stream.
    pub fn finish(mut self) -> DemuxEnd {
        match self.status {
            Some(status) => DemuxEnd::Complete {
                status,
                trailer: self.trailer,
            },
            None => {
                let mut unflushed = Vec::new();
                if self.held_newline {
                    unflushed.push(b'\n');
                }
                unflushed.append(&mut self.pending);
                DemuxEnd::Truncated { unflushed }
            }
        }
    }

    fn could_be_separator(&self, partial: &[u8]) -> bool {
        if partial.len() <= self.separator.len() {
            self.separator.starts_with(partial)
        } else {
            partial.starts_with(&self.separator)
        }
    }

    fn parse_separator(&self, line: &[u8]) -> Option<i32> {
        let rest = line.strip_prefix(self.separator.as_slice())?;
        let digits = rest.strip_prefix(b":")?;
        std::str::from_utf8(digits).ok()?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEP: &str = "6f1c2d8e9a7b4c3d";

    fn framed(output: &[u8], status: i32, trailer: &[u8]) -> Vec<u8> {
        let mut stream = output.to_vec();
        stream.extend_from_slice(format!("\n{}:{}\n", SEP, status).as_bytes());
        stream.extend_from_slice(trailer);
        stream
    }

    fn run(stream: &[u8], chunk: usize) -> (Vec<u8>, DemuxEnd) {
        let mut demux = SeparatorDemux::new(SEP);
        let mut out = Vec::new();
        for piece in stream.chunks(chunk) {
            out.extend(demux.feed(piece));
        }
        (out, demux.finish())
    }

    #[test]
    fn test_output_is_exact_for_any_chunking() {
        let cases: [&[u8]; 4] = [b"", b"hello\n", b"no newline", b"a\n\nb\x00\x1b[0m\r\n"];
        for output in cases {
            let stream = framed(output, 0, b"TRAILER\nbytes");
            for chunk in [1, 3, 7, 4096] {
                let (out, end) = run(&stream, chunk);
                assert_eq!(out, output, "chunk size {}", chunk);
                assert_eq!(
                    end,
                    DemuxEnd::Complete {
                        status: 0,
                        trailer: b"TRAILER\nbytes".to_vec()
                    }
                );
            }
        }
    }

    #[test]
    fn test_status_is_carried_by_separator() {
        let (_, end) = run(&framed(b"boom\n", 17, b""), 5);
        assert_eq!(
            end,
            DemuxEnd::Complete {
                status: 17,
                trailer: Vec::new()
            }
        );
    }

    #[test]
    fn test_separator_mid_line_is_output() {
        let output = format!("prefix {}:0\nmore", SEP);
        let (out, end) = run(&framed(output.as_bytes(), 0, b""), 2);
        assert_eq!(out, output.as_bytes());
        assert!(matches!(end, DemuxEnd::Complete { .. }));
    }

    #[test]
    fn test_truncated_stream_returns_held_output() {
        let (out, end) = run(b"line one\npartial", 4);
        assert_eq!(out, b"line one\npartial");
        assert_eq!(end, DemuxEnd::Truncated { unflushed: Vec::new() });

        let (out, end) = run(b"line one\n", 64);
        assert_eq!(out, b"line one");
        assert_eq!(
            end,
            DemuxEnd::Truncated {
                unflushed: b"\n".to_vec()
            }
        );
    }

    #[test]
    fn test_partial_lines_are_forwarded_live() {
        let mut demux = SeparatorDemux::new(SEP);
        assert_eq!(demux.feed(b"50%"), b"50%");
        assert_eq!(demux.feed(b" done\n"), b" done");
        // A fresh line that might be the separator is held back.
        assert_eq!(demux.feed(&SEP.as_bytes()[..4]), b"");
        assert!(!demux.separator_seen());
    }
}
