/// Per-call options shared by entity and collection mutations.
///
/// Entities read `silent`, `unset` and `validate`; collections additionally
/// read `add`, `remove`, `merge`, `at` and `sort`. Options are passed down
/// unchanged to nested `set` calls (relation reconciliation, merges).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOptions {
    /// Suppress every event.
    pub silent: bool,
    /// Delete the named attributes instead of storing values.
    pub unset: bool,
    /// Run the kind's validator before writing.
    pub validate: bool,
    /// Collections: add unknown candidates.
    pub add: bool,
    /// Collections: remove members missing from the candidates.
    pub remove: bool,
    /// Collections: merge candidates into matching members.
    pub merge: bool,
    /// Collections: insertion index. Clamped to `[0, len]`; negative values
    /// count back from the end once.
    pub at: Option<isize>,
    /// Collections: allow re-sorting by the comparator.
    pub sort: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            silent: false,
            unset: false,
            validate: false,
            add: true,
            remove: true,
            merge: true,
            at: None,
            sort: true,
        }
    }
}

impl SetOptions {
    /// Default options with `silent` set.
    #[must_use]
    pub fn silent() -> Self {
        Self::default().with_silent(true)
    }

    /// Default options with `validate` set.
    #[must_use]
    pub fn validated() -> Self {
        Self::default().with_validate(true)
    }

    #[must_use]
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    #[must_use]
    pub fn with_unset(mut self, unset: bool) -> Self {
        self.unset = unset;
        self
    }

    #[must_use]
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    #[must_use]
    pub fn with_add(mut self, add: bool) -> Self {
        self.add = add;
        self
    }

    #[must_use]
    pub fn with_remove(mut self, remove: bool) -> Self {
        self.remove = remove;
        self
    }

    #[must_use]
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    #[must_use]
    pub fn with_at(mut self, at: isize) -> Self {
        self.at = Some(at);
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: bool) -> Self {
        self.sort = sort;
        self
    }
}
