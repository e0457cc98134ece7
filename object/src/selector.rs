use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

/// Numeric selector shared by every object that defines the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectorId(pub u16);

impl fmt::Display for SelectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct SelectorTableImpl {
    names: Vec<Option<Arc<str>>>,
    mappings: HashMap<Arc<str>, SelectorId>,
}

impl SelectorTableImpl {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            mappings: HashMap::new(),
        }
    }

    fn define(&mut self, id: SelectorId, name: &str) {
        let index = id.0 as usize;
        if self.names.len() <= index {
            self.names.resize(index + 1, None);
        }
        let name = Arc::<str>::from(name);
        if let Some(old) = self.names[index].replace(name.clone()) {
            self.mappings.remove(&old);
        }
        self.mappings.entry(name).or_insert(id);
    }

    fn get_or_add(&mut self, name: &str) -> SelectorId {
        if let Some(&id) = self.mappings.get(name) {
            return id;
        }
        let id = SelectorId(self.names.len() as u16);
        self.define(id, name);
        id
    }
}

/// The selector vocabulary of a game.
///
/// Cloning shares the table. Ids are dense from zero; vocabularies loaded
/// from game data may leave gaps, filled with [`SelectorTable::define`].
#[derive(Clone)]
pub struct SelectorTable(Arc<RwLock<SelectorTableImpl>>);

impl SelectorTable {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(SelectorTableImpl::new())))
    }

    /// Build a table whose ids are the positions in `names`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let table = Self::new();
        {
            let mut inner = table.0.write();
            for (i, name) in names.into_iter().enumerate() {
                inner.define(SelectorId(i as u16), name.as_ref());
            }
        }
        table
    }

    /// Id for `name`, allocating the next free id if it is new.
    pub fn add(&self, name: &str) -> SelectorId {
        self.0.write().get_or_add(name)
    }

    pub fn define(&self, id: SelectorId, name: &str) {
        self.0.write().define(id, name);
    }

    pub fn name(&self, id: SelectorId) -> Option<Arc<str>> {
        self.0.read().names.get(id.0 as usize).cloned().flatten()
    }

    pub fn find(&self, name: &str) -> Option<SelectorId> {
        self.0.read().mappings.get(name).copied()
    }

    /// Name for diagnostics; unknown ids render as `<noname N>`.
    pub fn display_name(&self, id: SelectorId) -> String {
        match self.name(id) {
            Some(name) => name.to_string(),
            None => format!("<noname {}>", id.0),
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SelectorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SelectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorTable")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let table = SelectorTable::new();
        let a = table.add("init");
        let b = table.add("doit");
        assert_eq!(table.add("init"), a);
        assert_ne!(a, b);
        assert_eq!(table.name(b).as_deref(), Some("doit"));
        assert_eq!(table.find("doit"), Some(b));
    }

    #[test]
    fn vocabulary_with_gaps() {
        let table = SelectorTable::from_names(["species", "superClass"]);
        table.define(SelectorId(10), "client");
        assert_eq!(table.find("superClass"), Some(SelectorId(1)));
        assert_eq!(table.name(SelectorId(10)).as_deref(), Some("client"));
        assert_eq!(table.name(SelectorId(5)), None);
        assert_eq!(table.display_name(SelectorId(5)), "<noname 5>");
        assert_eq!(table.add("new"), SelectorId(11));
    }

    #[test]
    fn clones_share_state() {
        let table = SelectorTable::new();
        let shared = table.clone();
        let id = shared.add("x");
        assert_eq!(table.find("x"), Some(id));
    }
}
