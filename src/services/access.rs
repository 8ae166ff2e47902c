//! Host-supplied access decisions for existing attachments.

use crate::models::attachment::Attachment;

/// Decides whether a caller may read or edit an attachment. Denials surface as
/// not-found so callers cannot discover ids.
pub trait AccessPolicy: Send + Sync {
    fn can_access(&self, actor: Option<&str>, attachment: &Attachment) -> bool;
}

/// Any identified caller may access any attachment.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifiedCallers;

impl AccessPolicy for IdentifiedCallers {
    fn can_access(&self, actor: Option<&str>, _attachment: &Attachment) -> bool {
        actor.is_some_and(|user| !user.trim().is_empty())
    }
}

/// Everyone may access everything. For trusted internal deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl AccessPolicy for OpenAccess {
    fn can_access(&self, _actor: Option<&str>, _attachment: &Attachment) -> bool {
        true
    }
}
