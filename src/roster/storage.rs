//! libsql-backed roster persistence, grounded in the reference source's
//! `pjs.roster.Roster` (contact CRUD, group CRUD, subscription updates) and
//! carrying over its two distinct roster-loading query shapes: the full
//! roster for `iq-roster-get` versus the narrower subscribed-to set used
//! to build login-time presence probes.

use jid::BareJid;
use tracing::instrument;

use crate::jid_store::{JidStore, StoreError};
use crate::roster::RosterItem;
use crate::subscription::SubState;

fn sub_to_int(sub: SubState) -> i64 {
    match sub {
        SubState::None => 0,
        SubState::NonePendingOut => 1,
        SubState::NonePendingIn => 2,
        SubState::NonePendingInOut => 3,
        SubState::To => 4,
        SubState::ToPendingIn => 5,
        SubState::From => 6,
        SubState::FromPendingOut => 7,
        SubState::Both => 8,
    }
}

fn int_to_sub(n: i64) -> SubState {
    match n {
        0 => SubState::None,
        1 => SubState::NonePendingOut,
        2 => SubState::NonePendingIn,
        3 => SubState::NonePendingInOut,
        4 => SubState::To,
        5 => SubState::ToPendingIn,
        6 => SubState::From,
        7 => SubState::FromPendingOut,
        8 => SubState::Both,
        _ => SubState::None,
    }
}

/// Roster storage for one server, sharing the [`JidStore`] database so
/// contact rows can be joined against `jids` without a second connection
/// pool.
#[derive(Clone)]
pub struct RosterStore {
    jids: JidStore,
}

impl RosterStore {
    pub fn new(jids: JidStore) -> Self {
        RosterStore { jids }
    }

    async fn userid_of(&self, owner: &BareJid) -> Result<i64, StoreError> {
        self.jids
            .id_for(owner)
            .await?
            .ok_or_else(|| StoreError::Query(format!("no jids row for {owner}")))
    }

    /// Finds or creates the `jids` row for `contact`, returning its id.
    /// Contacts that have never authenticated locally still need an id to
    /// be referenced from `roster`/`rostergroupitems` (`updateContact`'s
    /// insert-empty-password path).
    async fn contact_id(&self, contact: &BareJid) -> Result<i64, StoreError> {
        if let Some(id) = self.jids.id_for(contact).await? {
            return Ok(id);
        }
        let conn = self.jids.connect()?;
        conn.execute(
            "INSERT INTO jids (jid, password) VALUES (?1, '')",
            libsql::params![contact.to_string()],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        self.jids
            .id_for(contact)
            .await?
            .ok_or_else(|| StoreError::Query("contact insert did not create a row".into()))
    }

    /// Full roster for `iq-roster-get`: every contact regardless of
    /// subscription state.
    #[instrument(skip(self))]
    pub async fn full_roster(&self, owner: &BareJid) -> Result<Vec<RosterItem>, StoreError> {
        let uid = self.userid_of(owner).await?;
        let conn = self.jids.connect()?;
        let mut rows = conn
            .query(
                "SELECT roster.contactid, roster.name, roster.subscription, contactjids.jid \
                 FROM roster \
                 JOIN jids AS contactjids ON contactjids.id = roster.contactid \
                 WHERE roster.userid = ?1",
                libsql::params![uid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            let contact_id: i64 = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
            let name: Option<String> = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
            let sub: i64 = row.get(2).map_err(|e| StoreError::Query(e.to_string()))?;
            let cjid: String = row.get(3).map_err(|e| StoreError::Query(e.to_string()))?;
            let contact: BareJid = cjid.parse().map_err(|_| StoreError::Query(format!("bad jid in roster: {cjid}")))?;
            let groups = self.groups_of(uid, contact_id).await?;
            items.push(RosterItem { contact, name, subscription: int_to_sub(sub), groups });
        }
        Ok(items)
    }

    /// The narrower set `pjs.roster.Roster.loadRoster` builds: only
    /// contacts the user is (at least partly) subscribed `to` — used to
    /// generate `<presence type='probe'>` stanzas on login.
    #[instrument(skip(self))]
    pub async fn subscribed_to(&self, owner: &BareJid) -> Result<Vec<BareJid>, StoreError> {
        let uid = self.userid_of(owner).await?;
        let conn = self.jids.connect()?;
        let mut rows = conn
            .query(
                "SELECT contactjids.jid \
                 FROM roster \
                 JOIN jids AS contactjids ON contactjids.id = roster.contactid \
                 WHERE roster.userid = ?1 AND roster.subscription IN (?2, ?3, ?4)",
                libsql::params![
                    uid,
                    sub_to_int(SubState::To),
                    sub_to_int(SubState::ToPendingIn),
                    sub_to_int(SubState::Both)
                ],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            let cjid: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
            out.push(cjid.parse().map_err(|_| StoreError::Query(format!("bad jid in roster: {cjid}")))?);
        }
        Ok(out)
    }

    /// Contacts subscribed to the user's presence (`from`/`from+out`/`both`)
    /// — the fan-out list for the user's own presence broadcasts
    /// (`Roster.getPresenceSubscribers`).
    #[instrument(skip(self))]
    pub async fn presence_subscribers(&self, owner: &BareJid) -> Result<Vec<BareJid>, StoreError> {
        let uid = self.userid_of(owner).await?;
        let conn = self.jids.connect()?;
        let mut rows = conn
            .query(
                "SELECT contactjids.jid \
                 FROM roster \
                 JOIN jids AS contactjids ON contactjids.id = roster.contactid \
                 WHERE roster.userid = ?1 AND roster.subscription IN (?2, ?3, ?4)",
                libsql::params![
                    uid,
                    sub_to_int(SubState::From),
                    sub_to_int(SubState::FromPendingOut),
                    sub_to_int(SubState::Both)
                ],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            let cjid: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
            out.push(cjid.parse().map_err(|_| StoreError::Query(format!("bad jid in roster: {cjid}")))?);
        }
        Ok(out)
    }

    async fn groups_of(&self, userid: i64, contact_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.jids.connect()?;
        let mut rows = conn
            .query(
                "SELECT rgs.name FROM rostergroups AS rgs \
                 JOIN rostergroupitems AS rgi ON rgi.groupid = rgs.groupid \
                 WHERE rgs.userid = ?1 AND rgi.contactid = ?2",
                libsql::params![userid, contact_id],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            out.push(row.get::<String>(0).map_err(|e| StoreError::Query(e.to_string()))?);
        }
        Ok(out)
    }

    /// Returns the single subscription state for one roster entry, or
    /// `None` when the contact isn't in the roster at all.
    #[instrument(skip(self))]
    pub async fn subscription_of(&self, owner: &BareJid, contact: &BareJid) -> Result<Option<SubState>, StoreError> {
        let uid = self.userid_of(owner).await?;
        let Some(cid) = self.jids.id_for(contact).await? else {
            return Ok(None);
        };
        let conn = self.jids.connect()?;
        let mut rows = conn
            .query(
                "SELECT subscription FROM roster WHERE userid = ?1 AND contactid = ?2",
                libsql::params![uid, cid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        match rows.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
            Some(row) => Ok(Some(int_to_sub(row.get(0).map_err(|e| StoreError::Query(e.to_string()))?))),
            None => Ok(None),
        }
    }

    /// Adds or updates a roster entry and its group memberships
    /// (`updateContact`). Does not touch `subscription` — that is driven
    /// exclusively by incoming `<presence>` via [`Self::set_subscription`].
    #[instrument(skip(self, groups))]
    pub async fn upsert_contact(
        &self,
        owner: &BareJid,
        contact: &BareJid,
        name: Option<&str>,
        groups: &[String],
    ) -> Result<(), StoreError> {
        let uid = self.userid_of(owner).await?;
        let cid = self.contact_id(contact).await?;
        let conn = self.jids.connect()?;

        let mut existing = conn
            .query(
                "SELECT 1 FROM roster WHERE userid = ?1 AND contactid = ?2",
                libsql::params![uid, cid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        let is_update = existing.next().await.map_err(|e| StoreError::Query(e.to_string()))?.is_some();

        if is_update {
            conn.execute(
                "UPDATE roster SET name = ?1 WHERE userid = ?2 AND contactid = ?3",
                libsql::params![name.unwrap_or(""), uid, cid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        } else {
            conn.execute(
                "INSERT INTO roster (userid, contactid, name, subscription) VALUES (?1, ?2, ?3, ?4)",
                libsql::params![uid, cid, name.unwrap_or(""), sub_to_int(SubState::None)],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        conn.execute(
            "DELETE FROM rostergroupitems WHERE contactid = ?1 AND groupid IN \
             (SELECT groupid FROM rostergroups WHERE userid = ?2)",
            libsql::params![cid, uid],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        for group_name in groups {
            let mut group_row = conn
                .query(
                    "SELECT groupid FROM rostergroups WHERE userid = ?1 AND name = ?2",
                    libsql::params![uid, group_name.clone()],
                )
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let gid: i64 = match group_row.next().await.map_err(|e| StoreError::Query(e.to_string()))? {
                Some(row) => row.get(0).map_err(|e| StoreError::Query(e.to_string()))?,
                None => {
                    conn.execute(
                        "INSERT INTO rostergroups (userid, name) VALUES (?1, ?2)",
                        libsql::params![uid, group_name.clone()],
                    )
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                    conn.last_insert_rowid()
                }
            };
            conn.execute(
                "INSERT INTO rostergroupitems (groupid, contactid) VALUES (?1, ?2)",
                libsql::params![gid, cid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        Ok(())
    }

    /// Removes a contact entirely from the user's roster (`removeContact`).
    #[instrument(skip(self))]
    pub async fn remove_contact(&self, owner: &BareJid, contact: &BareJid) -> Result<(), StoreError> {
        let uid = self.userid_of(owner).await?;
        let Some(cid) = self.jids.id_for(contact).await? else {
            return Ok(());
        };
        let conn = self.jids.connect()?;
        conn.execute(
            "DELETE FROM rostergroupitems WHERE groupid IN \
             (SELECT groupid FROM rostergroups WHERE userid = ?1) AND contactid = ?2",
            libsql::params![uid, cid],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        conn.execute(
            "DELETE FROM roster WHERE userid = ?1 AND contactid = ?2",
            libsql::params![uid, cid],
        )
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Updates only the subscription state for an existing (or implicitly
    /// created) roster entry, driven by the presence-subscription automaton
    /// in [`crate::subscription`].
    #[instrument(skip(self))]
    pub async fn set_subscription(&self, owner: &BareJid, contact: &BareJid, sub: SubState) -> Result<(), StoreError> {
        let uid = self.userid_of(owner).await?;
        let cid = self.contact_id(contact).await?;
        let conn = self.jids.connect()?;

        let mut existing = conn
            .query(
                "SELECT 1 FROM roster WHERE userid = ?1 AND contactid = ?2",
                libsql::params![uid, cid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        if existing.next().await.map_err(|e| StoreError::Query(e.to_string()))?.is_some() {
            conn.execute(
                "UPDATE roster SET subscription = ?1 WHERE userid = ?2 AND contactid = ?3",
                libsql::params![sub_to_int(sub), uid, cid],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        } else {
            conn.execute(
                "INSERT INTO roster (userid, contactid, name, subscription) VALUES (?1, ?2, '', ?3)",
                libsql::params![uid, cid, sub_to_int(sub)],
            )
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }
        Ok(())
    }
}
