//! Channel-ACL chain: may this client be handed this bundle of channels?

use tracing::debug;
use tracing::warn;

use crate::channel::Recipient;
use crate::dispatch::DispatchOperation;
use crate::error::PolicyError;
use crate::registry::CapabilityList;

/// Channel-ACL capability.
pub trait ChannelAcl: Send + Sync {
    /// Whether `recipient` may receive the channels in `operation`.
    fn authorize(&self, recipient: &Recipient, operation: &DispatchOperation) -> bool;
}

/// Run the channel-ACL chain before handler selection.
///
/// Stops at the first plugin that refuses. The caller decides what to do
/// with the channels on denial.
pub fn authorize_handler(
    acls: &CapabilityList,
    recipient: &Recipient,
    operation: &DispatchOperation,
) -> Result<(), PolicyError> {
    for record in acls.iter() {
        let Some(acl) = record.channel_acl() else {
            continue;
        };
        debug!(plugin = %record.name(), %recipient, "checking channel ACL");
        if !acl.authorize(recipient, operation) {
            warn!(plugin = %record.name(), %recipient, channels = operation.channel_count(), "handler denied by channel ACL");
            return Err(PolicyError::access_denied(format!(
                "permission denied by channel ACL plugin '{}' for '{}'",
                record.name(),
                recipient.name
            )));
        }
    }
    Ok(())
}
