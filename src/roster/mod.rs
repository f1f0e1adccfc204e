//! Roster management (component B): items, groups, and libsql-backed
//! storage matching the schema in §6 (`jids`, `roster`, `rostergroups`,
//! `rostergroupitems`).

mod storage;

pub use storage::RosterStore;

use jid::BareJid;

use crate::subscription::SubState;

#[derive(Debug, Clone)]
pub struct RosterItem {
    pub contact: BareJid,
    pub name: Option<String>,
    pub subscription: SubState,
    pub groups: Vec<String>,
}

impl RosterItem {
    pub fn to_element(&self) -> minidom::Element {
        let mut builder = minidom::Element::builder("item", crate::parser::ns::IQ_ROSTER)
            .attr("jid", self.contact.to_string())
            .attr("subscription", self.subscription.roster_attr());
        if let Some(name) = &self.name {
            builder = builder.attr("name", name.clone());
        }
        if self.subscription.ask_subscribe() {
            builder = builder.attr("ask", "subscribe");
        }
        let mut el = builder.build();
        for g in &self.groups {
            el.append_child(minidom::Element::builder("group", crate::parser::ns::IQ_ROSTER).append(g.clone()).build());
        }
        el
    }
}
