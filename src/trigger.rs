/// Mutation hooks
///
/// Hooks are registered per relation and trigger type and run synchronously
/// in registration order, receiving the mutating cursor. A pre-hook may
/// change the cursor's buffer before it is written; an error from a pre-hook
/// aborts the mutation. Post-hooks run after the row and every dependent
/// materialized view have been written.

use crate::cursor::Cursor;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type Hook = Arc<dyn Fn(&mut Cursor) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    PreInsert,
    PostInsert,
    PreUpdate,
    PostUpdate,
    PreDelete,
    PostDelete,
}

/// Hooks of every relation, keyed by relation name
#[derive(Default)]
pub struct TriggerRegistry {
    hooks: RwLock<HashMap<(String, TriggerType), Vec<Hook>>>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, relation: &str, trigger: TriggerType, hook: F)
    where
        F: Fn(&mut Cursor) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .entry((relation.to_string(), trigger))
            .or_default()
            .push(Arc::new(hook));
    }

    /// Hooks for one relation and trigger, in registration order.
    pub fn hooks(&self, relation: &str, trigger: TriggerType) -> Vec<Hook> {
        self.hooks
            .read()
            .get(&(relation.to_string(), trigger))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every hook of a relation.
    pub fn clear(&self, relation: &str) {
        self.hooks.write().retain(|(name, _), _| name != relation);
    }

    /// Run the hooks against `cursor`. The registry lock is released before
    /// the first hook runs, so hooks may themselves write to other relations.
    pub(crate) fn fire(&self, cursor: &mut Cursor, trigger: TriggerType) -> Result<()> {
        let hooks = self.hooks(cursor.relation_name(), trigger);
        for hook in hooks {
            hook(cursor)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        f.debug_struct("TriggerRegistry")
            .field("registered", &hooks.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
