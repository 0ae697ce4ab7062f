// Prompt detection for interactive password feeds

/// What the watcher decided about a chunk of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watch {
    /// Prompt not seen yet; the chunk is held back
    Waiting,
    /// Prompt just seen; write the password now. Carries the output that
    /// followed the prompt in the same chunk.
    Prompted(Vec<u8>),
    /// Prompt was seen earlier; the chunk is process output
    Output(Vec<u8>),
}

/// Buffers output until a prompt substring shows up, then consumes the
/// prompt so it never reaches the caller's stdout.
#[derive(Debug)]
pub struct PromptWatcher {
    prompt: Vec<u8>,
    pending: Vec<u8>,
    seen: bool,
}

impl PromptWatcher {
    pub fn new(prompt: &str) -> Self {
        PromptWatcher {
            prompt: prompt.as_bytes().to_vec(),
            pending: Vec::new(),
            seen: false,
        }
    }

    pub fn seen(&self) -> bool {
        self.seen
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Watch {
        if self.seen {
            return Watch::Output(chunk.to_vec());
        }

        self.pending.extend_from_slice(chunk);
        match find(&self.pending, &self.prompt) {
            Some(pos) => {
                self.seen = true;
                let rest = self.pending.split_off(pos + self.prompt.len());
                self.pending.clear();
                Watch::Prompted(rest)
            }
            None => Watch::Waiting,
        }
    }

    /// Output held back because the prompt never came (e.g. su failing
    /// before asking).
    pub fn finish(self) -> Vec<u8> {
        if self.seen {
            Vec::new()
        } else {
            self.pending
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
