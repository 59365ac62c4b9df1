//! Worker slot tokens.
//!
//! Every in-flight unit runs under a token: a small integer plus a string
//! that is unique across runs. Both are exported to the child process so it
//! can namespace shared resources (temp-file prefixes, database names).
//!
//! The pool is only ever touched by the runner's coordinating loop, so it is
//! plain owned state with no locking.

/// An acquired token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// 1-based slot number.
    pub id: usize,

    /// `<id>_<uuid>`, unique across runs.
    pub unique: String,
}

#[derive(Debug)]
struct Slot {
    token: Token,
    available: bool,
}

/// A fixed-size set of tokens, one per configured process.
#[derive(Debug)]
pub struct TokenPool {
    slots: Vec<Slot>,
}

impl TokenPool {
    /// Creates a pool with tokens `1..=size`.
    pub fn new(size: usize) -> Self {
        let slots = (1..=size.max(1))
            .map(|id| Slot {
                token: Token {
                    id,
                    unique: format!("{}_{}", id, uuid::Uuid::new_v4().simple()),
                },
                available: true,
            })
            .collect();
        Self { slots }
    }

    /// Takes the lowest available token, if any.
    pub fn acquire(&mut self) -> Option<Token> {
        let slot = self.slots.iter_mut().find(|s| s.available)?;
        slot.available = false;
        Some(slot.token.clone())
    }

    /// Returns a token to the pool.
    ///
    /// Releasing a token that is not held is a no-op.
    pub fn release(&mut self, id: usize) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.token.id == id) {
            slot.available = true;
        }
    }

    /// Number of tokens currently free.
    pub fn available(&self) -> usize {
        self.slots.iter().filter(|s| s.available).count()
    }

    /// Total number of tokens.
    pub fn size(&self) -> usize {
        self.slots.len()
    }
}
