//! Lifecycle hooks.

use crate::error::DbResult;

/// Callbacks run around model operations. Every hook defaults to a no-op.
///
/// Create and update run `before_validate`, `validate` and `after_validate`
/// (unless validation is skipped) and then `before_<action>`. The statement
/// runs next, followed by `after_<action>`. Commit hooks run once the model's
/// transaction commits, and `after_rollback` once it rolls back.
///
/// A hook error stops the element it was raised for. If the model has a
/// transaction open, that transaction is rolled back.
pub trait Hooks {
    fn before_validate(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn validate(&self) -> DbResult<()> {
        Ok(())
    }

    fn after_validate(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn before_create(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_create(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn before_update(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_update(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn before_delete(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_delete(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_create_commit(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_update_commit(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_delete_commit(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn after_rollback(&mut self) -> DbResult<()> {
        Ok(())
    }
}

/// The operation a model is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    All,
    Find,
    Count,
    Create,
    Update,
    Delete,
    DeleteAll,
    UpdateAll,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::All => "all",
            Action::Find => "find",
            Action::Count => "count",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::DeleteAll => "delete_all",
            Action::UpdateAll => "update_all",
        }
    }

    /// Actions that run per-element hooks.
    pub fn has_hooks(&self) -> bool {
        matches!(self, Action::Create | Action::Update | Action::Delete)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Validation plus the `before_<action>` hook. Stops at the first error.
pub(crate) fn before<H: Hooks + ?Sized>(action: Action, item: &mut H, skip_validate: bool) -> DbResult<()> {
    if matches!(action, Action::Create | Action::Update) && !skip_validate {
        item.before_validate()?;
        item.validate()?;
        item.after_validate()?;
    }
    match action {
        Action::Create => item.before_create(),
        Action::Update => item.before_update(),
        Action::Delete => item.before_delete(),
        _ => Ok(()),
    }
}

pub(crate) fn after<H: Hooks + ?Sized>(action: Action, item: &mut H) -> DbResult<()> {
    match action {
        Action::Create => item.after_create(),
        Action::Update => item.after_update(),
        Action::Delete => item.after_delete(),
        _ => Ok(()),
    }
}

pub(crate) fn after_commit<H: Hooks + ?Sized>(action: Action, item: &mut H) -> DbResult<()> {
    match action {
        Action::Create => item.after_create_commit(),
        Action::Update => item.after_update_commit(),
        Action::Delete => item.after_delete_commit(),
        _ => Ok(()),
    }
}
