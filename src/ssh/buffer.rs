use std::mem;

const ESC: char = '\x1b';
const BEL: char = '\x07';
const MAX_ESCAPE_CARRY: usize = 256;

pub(crate) fn tail(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}

pub(crate) fn split_incomplete_escape(text: &str) -> (&str, &str) {
    let Some(start) = text.rfind(ESC) else {
        return (text, "");
    };
    let sequence = &text[start..];
    if sequence.len() > MAX_ESCAPE_CARRY || escape_is_complete(sequence) {
        return (text, "");
    }
    text.split_at(start)
}

fn escape_is_complete(sequence: &str) -> bool {
    let mut chars = sequence.chars().skip(1);
    match chars.next() {
        None => false,
        // CSI: parameters and intermediates, then one final byte.
        Some('[') => chars.any(|c| ('\x40'..='\x7e').contains(&c)),
        // OSC and friends end with BEL or ST.
        Some(']' | 'P' | '_' | '^') => {
            let body: String = chars.collect();
            body.contains(BEL) || body.contains("\x1b\\")
        }
        // Charset designators take one more character.
        Some('(' | ')' | '*' | '+') => chars.next().is_some(),
        Some(_) => true,
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamDecoder {
    utf8_carry: Vec<u8>,
    escape_carry: String,
}

impl StreamDecoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        let mut raw = mem::take(&mut self.utf8_carry);
        raw.extend_from_slice(bytes);

        let mut text = mem::take(&mut self.escape_carry);
        let mut rest = raw.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        let (complete, pending) = split_incomplete_escape(&text);
        self.escape_carry = pending.to_string();
        strip_ansi_escapes::strip_str(complete)
    }

    pub(crate) fn reset(&mut self) {
        self.utf8_carry.clear();
        self.escape_carry.clear();
    }
}

#[derive(Debug)]
pub(crate) struct OutputBuffers {
    display: String,
    automation: String,
    automation_chars: usize,
    cap: usize,
    received: u64,
    decoder: StreamDecoder,
}

impl OutputBuffers {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            display: String::new(),
            automation: String::new(),
            automation_chars: 0,
            cap,
            received: 0,
            decoder: StreamDecoder::default(),
        }
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        let text = self.decoder.decode(bytes);
        self.push_text(&text);
    }

    pub(crate) fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let count = text.chars().count();
        self.display.push_str(text);
        self.automation.push_str(text);
        self.automation_chars += count;
        self.received += count as u64;
        if self.automation_chars > self.cap {
            let excess = self.automation_chars - self.cap;
            let cut = self
                .automation
                .char_indices()
                .nth(excess)
                .map_or(self.automation.len(), |(index, _)| index);
            self.automation.drain(..cut);
            self.automation_chars = self.cap;
        }
    }

    pub(crate) fn take_display(&mut self) -> String {
        mem::take(&mut self.display)
    }

    pub(crate) fn display_tail(&self, n: usize) -> String {
        tail(&self.display, n).to_string()
    }

    pub(crate) fn automation_tail(&self, n: usize) -> String {
        tail(&self.automation, n).to_string()
    }

    /// Total characters ever appended; usable as a mark for
    /// [`OutputBuffers::automation_since`].
    pub(crate) fn received(&self) -> u64 {
        self.received
    }

    pub(crate) fn automation_since(&self, mark: u64) -> String {
        let fresh = usize::try_from(self.received.saturating_sub(mark)).unwrap_or(usize::MAX);
        tail(&self.automation, fresh.min(self.automation_chars)).to_string()
    }

    pub(crate) fn reset_stream(&mut self) {
        self.decoder.reset();
    }

    pub(crate) fn clear(&mut self) {
        self.display.clear();
        self.automation.clear();
        self.automation_chars = 0;
        self.decoder.reset();
    }
}
