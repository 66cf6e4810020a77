use std::collections::VecDeque;

/// The most recent output lines of one lane, kept so a crash can be
/// reported with some context.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_entries),
            max_entries,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.max_entries == 0 {
            return;
        }
        if self.lines.len() >= self.max_entries {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Buffered lines, oldest first, joined for a log message.
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
