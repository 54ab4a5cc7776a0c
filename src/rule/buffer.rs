//! Line decomposition of the working text and the per-pass write-set.

/// Line terminator preserved with each line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// Last line without a terminator
    None,
    /// `\n`
    Lf,
    /// `\r\n`
    CrLf,
    /// Lone `\r`
    Cr,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
            Self::Cr => "\r",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Line {
    content: String,
    ending: LineEnding,
}

/// The working text split into lines, each keeping its original terminator.
///
/// Joining the buffer without a write-set reproduces the source exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineBuffer {
    lines: Vec<Line>,
}

impl LineBuffer {
    /// Split text on `\n`, `\r\n` and lone `\r`.
    pub fn split(text: &str) -> Self {
        let mut lines = Vec::new();
        let bytes = text.as_bytes();
        let mut start = 0;
        let mut i = 0;

        while i < bytes.len() {
            let ending = match bytes[i] {
                b'\n' => Some((LineEnding::Lf, 1)),
                b'\r' if bytes.get(i + 1) == Some(&b'\n') => Some((LineEnding::CrLf, 2)),
                b'\r' => Some((LineEnding::Cr, 1)),
                _ => None,
            };

            match ending {
                Some((ending, width)) => {
                    lines.push(Line {
                        content: text[start..i].to_string(),
                        ending,
                    });
                    i += width;
                    start = i;
                }
                None => i += 1,
            }
        }

        if start < text.len() {
            lines.push(Line {
                content: text[start..].to_string(),
                ending: LineEnding::None,
            });
        }

        Self { lines }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Content of line `index` without its terminator.
    pub fn content(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(|l| l.content.as_str())
    }

    pub fn ending(&self, index: usize) -> Option<LineEnding> {
        self.lines.get(index).map(|l| l.ending)
    }

    /// Rejoin the original lines verbatim.
    pub fn join(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{}{}", l.content, l.ending.as_str()))
            .collect()
    }

    /// Rejoin, taking rewritten content from the write-set where present.
    pub fn join_with(&self, writes: &WriteSet) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            match writes.slot(i) {
                Some(Slot::Rewritten(content)) => out.push_str(content),
                _ => out.push_str(&line.content),
            }
            out.push_str(line.ending.as_str());
        }
        out
    }
}

/// State of one line index during a rule pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Slot {
    /// Not visited yet
    #[default]
    Unset,
    /// Finalized with its original content
    Kept,
    /// Finalized with new content
    Rewritten(String),
}

/// Which line indices have been finalized during the current rule pass.
///
/// A `Kept` slot may still be rewritten once (an occurrence search reaching
/// back to an already visited line); a `Rewritten` slot is final.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    slots: Vec<Slot>,
}

impl WriteSet {
    /// Create a write-set with every index unset.
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![Slot::Unset; len],
        }
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Whether the index has been finalized in any way.
    pub fn is_marked(&self, index: usize) -> bool {
        !matches!(self.slots.get(index), Some(Slot::Unset) | None)
    }

    pub fn is_rewritten(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Slot::Rewritten(_)))
    }

    /// Finalize an unset index with its original content.
    pub fn keep(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            if *slot == Slot::Unset {
                *slot = Slot::Kept;
            }
        }
    }

    /// Record new content. Returns `false` if the index was already rewritten
    /// or is out of range; the existing content is left untouched.
    pub fn rewrite(&mut self, index: usize, content: String) -> bool {
        match self.slots.get_mut(index) {
            Some(Slot::Rewritten(_)) | None => false,
            Some(slot) => {
                *slot = Slot::Rewritten(content);
                true
            }
        }
    }

    /// Number of rewritten indices.
    pub fn rewritten(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Rewritten(_)))
            .count()
    }
}
