//! Lookup of dialogs by id and by message

use std::collections::HashMap;

use lws_sip_core::{Request, Response, SipMessage};
use tracing::{debug, error};

use super::{Dialog, DialogId};
use crate::error::{Error, Result};

/// Every dialog the agent knows about
#[derive(Debug, Default)]
pub struct DialogTable {
    dialogs: HashMap<DialogId, Dialog>,
}

impl DialogTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dialog. An id that is already present is refused and the
    /// existing dialog left untouched.
    pub fn insert(&mut self, dialog: Dialog) -> Result<()> {
        if self.dialogs.contains_key(&dialog.id) {
            error!(dialog = %dialog.id, "Dialog key collision");
            return Err(Error::DialogCollision(dialog.id));
        }
        debug!(dialog = %dialog.id, state = %dialog.state, "Dialog created");
        self.dialogs.insert(dialog.id.clone(), dialog);
        Ok(())
    }

    pub fn get(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn get_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        self.dialogs.get_mut(id)
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.dialogs.contains_key(id)
    }

    pub fn remove(&mut self, id: &DialogId) -> Option<Dialog> {
        let removed = self.dialogs.remove(id);
        if removed.is_some() {
            debug!(dialog = %id, "Dialog removed");
        }
        removed
    }

    /// Id an incoming request would belong to: our tag is in To, theirs in
    /// From. `None` when the request carries no To tag.
    pub fn id_for_request(request: &Request) -> Option<DialogId> {
        let call_id = request.call_id().ok()?;
        let local = request.to_addr().ok()?;
        let remote = request.from_addr().ok()?;
        Some(DialogId::new(call_id, local.tag()?, remote.tag()?))
    }

    /// Id an incoming response would belong to: our tag is in From
    pub fn id_for_response(response: &Response) -> Option<DialogId> {
        let call_id = response.call_id().ok()?;
        let local = response.from_addr().ok()?;
        let remote = response.to_addr().ok()?;
        Some(DialogId::new(call_id, local.tag()?, remote.tag()?))
    }

    /// Existing dialog for an incoming request
    pub fn find_for_request(&self, request: &Request) -> Option<DialogId> {
        Self::id_for_request(request).filter(|id| self.dialogs.contains_key(id))
    }

    /// Existing dialog for an incoming response
    pub fn find_for_response(&self, response: &Response) -> Option<DialogId> {
        Self::id_for_response(response).filter(|id| self.dialogs.contains_key(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &DialogId> {
        self.dialogs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dialog> {
        self.dialogs.values()
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    pub fn clear(&mut self) {
        self.dialogs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_sip_core::builder::{SimpleRequestBuilder, SimpleResponseBuilder};
    use lws_sip_core::{Method, NameAddr, StatusCode, Uri, Via};

    fn invite() -> Request {
        SimpleRequestBuilder::new(Method::Invite, "sip:1002@example.com")
            .unwrap()
            .via(Via::new("UDP", "10.0.0.1", Some(5060), "z9hG4bKt1"))
            .from(NameAddr::new(Uri::sip("example.com").with_user("1001")).with_tag("a"))
            .to(NameAddr::new(Uri::sip("example.com").with_user("1002")))
            .call_id("table@10.0.0.1")
            .cseq(1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_insert_rejects_collision() {
        let request = invite();
        let response = SimpleResponseBuilder::from_request(&request, StatusCode::Ok, None)
            .to_tag("b")
            .build();
        let peer = "10.0.0.2:5060".parse().unwrap();
        let dialog = Dialog::from_uac_response(&request, &response, peer).unwrap();

        let mut table = DialogTable::new();
        table.insert(dialog.clone()).unwrap();
        assert!(matches!(
            table.insert(dialog),
            Err(Error::DialogCollision(_))
        ));
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.find_for_response(&response),
            Some(DialogId::new("table@10.0.0.1", "a", "b"))
        );
    }

    #[test]
    fn test_request_without_to_tag_has_no_dialog() {
        assert_eq!(DialogTable::id_for_request(&invite()), None);
    }
}
