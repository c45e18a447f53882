//! Per-preset cache of parsed LUTs.
//!
//! Each preset is parsed at most once per process. Successful tables are
//! shared behind an [`Arc`]; parse failures are remembered as well, so a
//! broken preset is neither fetched nor parsed again. Fetching is the
//! caller's concern: the library only sees the text.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::lut::{self, LutTable};
use crate::types::LutError;

/// Outcome of loading one preset.
pub type LutOutcome = Result<Arc<LutTable>, LutError>;

/// Parsed tables (and parse failures) keyed by preset id.
#[derive(Debug, Default)]
pub struct LutLibrary {
    entries: HashMap<String, LutOutcome>,
    parses: usize,
}

impl LutLibrary {
    /// Create an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached outcome for `preset`, or `None` if it was never loaded.
    #[must_use]
    pub fn get(&self, preset: &str) -> Option<LutOutcome> {
        self.entries.get(preset).cloned()
    }

    /// Returns `true` if `preset` has a cached outcome (success or failure).
    #[must_use]
    pub fn contains(&self, preset: &str) -> bool {
        self.entries.contains_key(preset)
    }

    /// Parse `text` as the table for `preset` and remember the outcome.
    ///
    /// A preset that already has an outcome is not parsed again; the
    /// cached outcome is returned instead.
    ///
    /// # Errors
    ///
    /// Returns the [`LutError`] from [`lut::parse`] (possibly cached).
    pub fn insert_text(&mut self, preset: &str, text: &str) -> LutOutcome {
        if let Some(outcome) = self.get(preset) {
            return outcome;
        }
        self.parses += 1;
        let outcome = lut::parse(text).map(Arc::new);
        match &outcome {
            Ok(table) => debug!(preset, size = table.size(), "parsed LUT"),
            Err(e) => warn!(preset, error = %e, "LUT rejected; preset disabled"),
        }
        self.entries.insert(preset.to_owned(), outcome.clone());
        outcome
    }

    /// Register an already-built table for `preset`, replacing any outcome.
    pub fn insert_table(&mut self, preset: &str, table: LutTable) -> Arc<LutTable> {
        let table = Arc::new(table);
        self.entries
            .insert(preset.to_owned(), Ok(Arc::clone(&table)));
        table
    }

    /// Number of times [`insert_text`](Self::insert_text) actually parsed.
    #[must_use]
    pub const fn parse_count(&self) -> usize {
        self.parses
    }

    /// Number of presets with a cached outcome.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no preset has been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
