//! Tables of known script bugs and how to get past them.
//!
//! The VM ships the matching mechanism only; games register their entries.

use core::ops::RangeInclusive;

use crate::error::CallOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkaroundSolution {
    /// Skip the operation, leaving the accumulator alone.
    Ignore,
    /// Perform the operation anyway.
    StillCall,
    /// Skip the operation and produce this value.
    Fake(u16),
}

/// How an entry constrains local procedure calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalCall {
    /// Matches only when the failing code is not inside a local call.
    #[default]
    NotLocal,
    /// Matches whether or not a local call is involved.
    Any,
    /// Matches only inside the local procedure at this offset.
    At(u32),
}

impl LocalCall {
    fn matches(self, offset: Option<u32>) -> bool {
        match (self, offset) {
            (LocalCall::Any, _) => true,
            (LocalCall::NotLocal, None) => true,
            (LocalCall::At(want), Some(got)) => want == got,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkaroundEntry {
    /// `None` applies to every game.
    pub game: Option<String>,
    pub room: Option<i16>,
    pub script: Option<u16>,
    /// How many superclass links above the receiver the method lives.
    pub inheritance_level: Option<u16>,
    pub object_name: Option<String>,
    pub method_name: String,
    pub local_call: LocalCall,
    /// Variable index or similar; `None` for any.
    pub indices: Option<RangeInclusive<u16>>,
    pub solution: WorkaroundSolution,
}

impl WorkaroundEntry {
    pub fn new(method_name: &str, solution: WorkaroundSolution) -> Self {
        Self {
            game: None,
            room: None,
            script: None,
            inheritance_level: None,
            object_name: None,
            method_name: method_name.to_owned(),
            local_call: LocalCall::NotLocal,
            indices: None,
            solution,
        }
    }

    pub fn game(mut self, game: &str) -> Self {
        self.game = Some(game.to_owned());
        self
    }

    pub fn room(mut self, room: i16) -> Self {
        self.room = Some(room);
        self
    }

    pub fn script(mut self, script: u16) -> Self {
        self.script = Some(script);
        self
    }

    pub fn inheritance_level(mut self, level: u16) -> Self {
        self.inheritance_level = Some(level);
        self
    }

    pub fn object(mut self, name: &str) -> Self {
        self.object_name = Some(name.to_owned());
        self
    }

    pub fn local_call(mut self, local_call: LocalCall) -> Self {
        self.local_call = local_call;
        self
    }

    pub fn index(mut self, index: u16) -> Self {
        self.indices = Some(index..=index);
        self
    }

    pub fn indices(mut self, indices: RangeInclusive<u16>) -> Self {
        self.indices = Some(indices);
        self
    }

    fn matches(
        &self,
        game: &str,
        origin: &CallOrigin,
        level: u16,
        object_name: &str,
        index: Option<u16>,
    ) -> bool {
        self.game.as_deref().is_none_or(|g| g == game)
            && self.room.is_none_or(|r| origin.room == Some(r))
            && self.script.is_none_or(|s| origin.script == Some(s))
            && self.inheritance_level.is_none_or(|l| l == level)
            && self.object_name.as_deref().is_none_or(|n| n == object_name)
            && self.method_name == origin.method
            && self.local_call.matches(origin.local_call_offset)
            && match (&self.indices, index) {
                (None, _) => true,
                (Some(range), Some(i)) => range.contains(&i),
                (Some(_), None) => false,
            }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkaroundTable {
    entries: Vec<WorkaroundEntry>,
}

impl WorkaroundTable {
    pub fn new(entries: Vec<WorkaroundEntry>) -> Self {
        Self { entries }
    }

    pub fn add(&mut self, entry: WorkaroundEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a solution for a failure at `origin`.
    ///
    /// `ancestry` names the receiver followed by its superclasses; the
    /// position in it is the inheritance level matched against entries.
    /// When it is empty only the origin's object name is tried.
    pub fn find(
        &self,
        game: &str,
        origin: &CallOrigin,
        ancestry: &[String],
        index: Option<u16>,
    ) -> Option<WorkaroundSolution> {
        let receiver = [origin.object.clone()];
        let names = if ancestry.is_empty() { &receiver[..] } else { ancestry };
        names.iter().enumerate().find_map(|(level, name)| {
            self.entries
                .iter()
                .find(|e| e.matches(game, origin, level as u16, name, index))
                .map(|e| e.solution)
        })
    }
}

/// The tables consulted by the interpreter itself. Kernel tables live with
/// their kernel functions.
#[derive(Debug, Clone, Default)]
pub struct Workarounds {
    pub uninitialized_temp: WorkaroundTable,
    pub uninitialized_param: WorkaroundTable,
    pub arithmetic: WorkaroundTable,
}

// ── Tests ──────────────────────────────────────────────────────────
