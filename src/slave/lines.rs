use std::fmt;

/// Longest partial line kept while waiting for its terminator.
pub const MAX_PENDING: usize = 64 * 1024;

/// Which pipe a chunk of player output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn index(self) -> usize {
        match self {
            OutputStream::Stdout => 0,
            OutputStream::Stderr => 1,
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Splits raw output into lines, keeping partial lines per stream until the
/// rest arrives. Status lines end in `\r`, everything else in `\n`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: [Vec<u8>; 2],
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete, non-empty line.
    pub fn push(&mut self, stream: OutputStream, bytes: &[u8]) -> Vec<String> {
        let pending = &mut self.pending[stream.index()];
        pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(end) = pending.iter().position(|&b| b == b'\r' || b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=end).collect();
            let line = decode(&raw[..end]);
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        if pending.len() > MAX_PENDING {
            log::warn!(
                "Dropping {} bytes of unterminated {} output",
                pending.len(),
                stream
            );
            pending.clear();
        }
        lines
    }

    pub fn pending_len(&self, stream: OutputStream) -> usize {
        self.pending[stream.index()].len()
    }

    pub fn clear(&mut self) {
        for pending in &mut self.pending {
            pending.clear();
        }
    }
}

// The player writes in the locale encoding; anything that is not valid UTF-8
// is replaced rather than dropped so markers on the same line still match.
fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unterminated_output_is_capped() {
        let mut splitter = LineSplitter::new();
        let noise = vec![b'x'; MAX_PENDING / 2 + 1];

        assert!(splitter.push(OutputStream::Stderr, &noise).is_empty());
        assert_eq!(splitter.pending_len(OutputStream::Stderr), noise.len());
        assert!(splitter.push(OutputStream::Stderr, &noise).is_empty());
        assert_eq!(splitter.pending_len(OutputStream::Stderr), 0);

        // Later lines on the same stream still come through
        assert_eq!(splitter.push(OutputStream::Stderr, b"Exiting...\n"), vec!["Exiting...".to_string()]);
    }

    #[test]
    fn test_partial_lines_wait_for_terminator() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(OutputStream::Stdout, b"ID_LENG").is_empty());
        assert_eq!(splitter.pending_len(OutputStream::Stdout), 7);

        let lines = splitter.push(OutputStream::Stdout, b"TH=120.00\nID_SEEK");
        assert_eq!(lines, vec!["ID_LENGTH=120.00".to_string()]);
        assert_eq!(splitter.pending_len(OutputStream::Stdout), 7);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(OutputStream::Stdout, b"A:  1.0 ").is_empty());
        let lines = splitter.push(OutputStream::Stderr, b"File not found: 'x'\n");
        assert_eq!(lines, vec!["File not found: 'x'".to_string()]);

        let lines = splitter.push(OutputStream::Stdout, b"V:  1.0\r");
        assert_eq!(lines, vec!["A:  1.0 V:  1.0".to_string()]);
    }

    #[test]
    fn test_crlf_and_blank_lines_skipped() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(OutputStream::Stdout, b"one\r\n\r\ntwo\n");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(OutputStream::Stdout, b"ID_CLIP_INFO_VALUE0=caf\xe9\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ID_CLIP_INFO_VALUE0=caf"));
    }

    #[test]
    fn test_clear_drops_partial_lines() {
        let mut splitter = LineSplitter::new();
        splitter.push(OutputStream::Stdout, b"stale");
        splitter.clear();
        assert_eq!(splitter.push(OutputStream::Stdout, b"fresh\n"), vec!["fresh".to_string()]);
    }
}
