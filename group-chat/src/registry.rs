//! Shared state touched by every session: who is online and which groups exist.
//!
//! Both registries own their map behind a single `parking_lot::Mutex` and only
//! expose synchronized operations. Sends performed while iterating happen with
//! the lock held, which keeps fan-out ordered against concurrent membership
//! changes. Sending is a non-blocking push onto the target's outbound queue, so
//! holding the lock never waits on a peer's socket.

use std::collections::{HashMap, hash_map::Entry};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Cheap, cloneable handle used to write to one connected peer.
///
/// The handle feeds the connection's writer task. Once the session tears down
/// and every clone is dropped, the writer flushes what is queued and closes the
/// socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues raw text (no newline appended). Returns `false` if the peer's
    /// writer has already gone away.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outbound.send(text.into()).is_ok()
    }

    pub fn send_line(&self, line: &str) -> bool {
        self.send(format!("{line}\n"))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("User {0} is already logged in.")]
    AlreadyLoggedIn(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("Group {0} does not exist.")]
    NotFound(String),
    #[error("Group {0} already exists.")]
    AlreadyExists(String),
    #[error("You are already in group {0}.")]
    AlreadyMember(String),
    #[error("You are not in group {0}.")]
    NotInGroup(String),
    #[error("You are not a member of group {0}.")]
    NotMember(String),
}

struct OnlineUser {
    username: String,
    handle: ConnectionHandle,
}

/// Authenticated connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, OnlineUser>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an authenticated connection.
    ///
    /// With the lock held, `greet` receives the other usernames online (sorted),
    /// `join_notice` goes to every connection already registered, and then the
    /// entry becomes visible. Nobody can message the newcomer before it has
    /// been greeted. A username may hold only one live connection; a second
    /// login is rejected without side effects.
    pub fn register(
        &self,
        handle: ConnectionHandle,
        username: &str,
        join_notice: &str,
        greet: impl FnOnce(&[String]),
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();

        if find_user(&entries, username).is_some() {
            return Err(RegistryError::AlreadyLoggedIn(username.to_string()));
        }

        let mut others: Vec<String> = entries
            .values()
            .map(|user| user.username.clone())
            .collect();
        others.sort();
        greet(&others);

        for user in entries.values() {
            user.handle.send_line(join_notice);
        }

        entries.insert(
            handle.id(),
            OnlineUser {
                username: username.to_string(),
                handle,
            },
        );
        Ok(())
    }

    /// Removes a connection, returning its username if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<String> {
        self.entries.lock().remove(&id).map(|user| user.username)
    }

    #[cfg(test)]
    fn username(&self, id: ConnectionId) -> Option<String> {
        self.entries.lock().get(&id).map(|user| user.username.clone())
    }

    #[cfg(test)]
    fn find_by_username(&self, username: &str) -> Option<ConnectionHandle> {
        find_user(&self.entries.lock(), username).map(|user| user.handle.clone())
    }

    /// Delivers a line to the connection registered as `username`.
    pub fn send_to_user(&self, username: &str, line: &str) -> bool {
        match find_user(&self.entries.lock(), username) {
            Some(user) => {
                user.handle.send_line(line);
                true
            }
            None => false,
        }
    }

    /// Delivers a line to every registered connection except `sender`.
    /// Returns the number of recipients.
    pub fn broadcast_except(&self, sender: ConnectionId, line: &str) -> usize {
        let mut delivered = 0;
        self.for_each(|handle, _| {
            if handle.id() != sender {
                handle.send_line(line);
                delivered += 1;
            }
        });
        delivered
    }

    /// Runs `f` for every registered connection while holding the lock.
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionHandle, &str)) {
        let entries = self.entries.lock();
        for user in entries.values() {
            f(&user.handle, &user.username);
        }
    }

    pub fn online_usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .values()
            .map(|user| user.username.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn find_user<'a>(
    entries: &'a HashMap<ConnectionId, OnlineUser>,
    username: &str,
) -> Option<&'a OnlineUser> {
    entries.values().find(|user| user.username == username)
}

/// Named groups and their member connections.
///
/// A group exists only while it has at least one member.
#[derive(Default)]
pub struct GroupRegistry {
    groups: Mutex<HashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, creator: &ConnectionHandle) -> Result<(), GroupError> {
        let mut groups = self.groups.lock();
        match groups.entry(name.to_string()) {
            Entry::Occupied(_) => Err(GroupError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(HashMap::from([(creator.id(), creator.clone())]));
                Ok(())
            }
        }
    }

    /// Adds `member` to the group and sends `notice` to the members already in it.
    pub fn join(
        &self,
        name: &str,
        member: &ConnectionHandle,
        notice: &str,
    ) -> Result<(), GroupError> {
        let mut groups = self.groups.lock();
        let members = groups
            .get_mut(name)
            .ok_or_else(|| GroupError::NotFound(name.to_string()))?;

        if members.contains_key(&member.id()) {
            return Err(GroupError::AlreadyMember(name.to_string()));
        }

        for existing in members.values() {
            existing.send_line(notice);
        }
        members.insert(member.id(), member.clone());
        Ok(())
    }

    /// Removes `member` and sends `notice` to whoever remains. Returns `true`
    /// when the group became empty and was deleted.
    pub fn leave(
        &self,
        name: &str,
        member: ConnectionId,
        notice: &str,
    ) -> Result<bool, GroupError> {
        let mut groups = self.groups.lock();
        let members = groups
            .get_mut(name)
            .ok_or_else(|| GroupError::NotFound(name.to_string()))?;

        if members.remove(&member).is_none() {
            return Err(GroupError::NotInGroup(name.to_string()));
        }

        if members.is_empty() {
            groups.remove(name);
            return Ok(true);
        }

        for remaining in members.values() {
            remaining.send_line(notice);
        }
        Ok(false)
    }

    /// Sends `line` to every member except `sender`, who must be a member.
    /// Returns the number of recipients.
    pub fn send(&self, name: &str, sender: ConnectionId, line: &str) -> Result<usize, GroupError> {
        let groups = self.groups.lock();
        let members = groups
            .get(name)
            .ok_or_else(|| GroupError::NotFound(name.to_string()))?;

        if !members.contains_key(&sender) {
            return Err(GroupError::NotMember(name.to_string()));
        }

        let mut delivered = 0;
        for (id, handle) in members {
            if *id != sender {
                handle.send_line(line);
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Drops `member` from every group, deleting groups left empty.
    /// Returns the names of the groups it was removed from.
    pub fn remove_member(&self, member: ConnectionId) -> Vec<String> {
        let mut groups = self.groups.lock();
        let mut left = Vec::new();
        groups.retain(|name, members| {
            if members.remove(&member).is_some() {
                left.push(name.clone());
            }
            !members.is_empty()
        });
        left.sort();
        left
    }

    /// Sorted member ids, or `None` if the group does not exist.
    pub fn members(&self, name: &str) -> Option<Vec<ConnectionId>> {
        self.groups.lock().get(name).map(|members| {
            let mut ids: Vec<ConnectionId> = members.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.lock().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(id: ConnectionId) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(id, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn admit(registry: &ConnectionRegistry, handle: ConnectionHandle, username: &str) {
        registry
            .register(handle, username, &format!("{username} has joined the chat"), |_| {})
            .expect("register");
    }

    #[test]
    fn register_greets_with_roster_and_notifies_others() {
        let registry = ConnectionRegistry::new();
        let (bob, mut bob_rx) = connection(1);
        let (alice, mut alice_rx) = connection(2);

        admit(&registry, bob, "bob");
        let mut roster = Vec::new();
        registry
            .register(alice, "alice", "alice has joined the chat", |online| {
                roster = online.to_vec();
            })
            .expect("alice");

        assert_eq!(roster, vec!["bob".to_string()]);
        assert_eq!(drain(&mut bob_rx), vec!["alice has joined the chat\n"]);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(registry.online_usernames(), vec!["alice", "bob"]);
    }

    #[test]
    fn duplicate_login_is_rejected_without_side_effects() {
        let registry = ConnectionRegistry::new();
        let (alice, mut alice_rx) = connection(1);
        let (alice_again, _again_rx) = connection(2);
        admit(&registry, alice, "alice");

        let mut greeted = false;
        let result = registry.register(alice_again, "alice", "alice has joined the chat", |_| {
            greeted = true;
        });

        assert_eq!(result, Err(RegistryError::AlreadyLoggedIn("alice".into())));
        assert!(!greeted);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.find_by_username("alice").map(|handle| handle.id()),
            Some(1)
        );
    }

    #[test]
    fn remove_happens_once() {
        let registry = ConnectionRegistry::new();
        let (alice, _rx) = connection(1);
        admit(&registry, alice, "alice");
        assert_eq!(registry.username(1), Some("alice".into()));

        assert_eq!(registry.remove(1), Some("alice".into()));
        assert_eq!(registry.remove(1), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_skips_sender() {
        let registry = ConnectionRegistry::new();
        let (alice, mut alice_rx) = connection(1);
        let (bob, mut bob_rx) = connection(2);
        let (carol, mut carol_rx) = connection(3);
        admit(&registry, alice, "alice");
        admit(&registry, bob, "bob");
        admit(&registry, carol, "carol");
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert_eq!(registry.broadcast_except(1, "[alice]: hi"), 2);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec!["[alice]: hi\n"]);
        assert_eq!(drain(&mut carol_rx), vec!["[alice]: hi\n"]);
    }

    #[test]
    fn send_to_user_targets_only_that_user() {
        let registry = ConnectionRegistry::new();
        let (alice, mut alice_rx) = connection(1);
        let (bob, mut bob_rx) = connection(2);
        admit(&registry, alice, "alice");
        admit(&registry, bob, "bob");
        drain(&mut alice_rx);

        assert!(registry.send_to_user("bob", "[alice]: hello"));
        assert!(!registry.send_to_user("nobody", "[alice]: hello"));
        assert_eq!(drain(&mut bob_rx), vec!["[alice]: hello\n"]);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn duplicate_create_keeps_original_members() {
        let groups = GroupRegistry::new();
        let (alice, _alice_rx) = connection(1);
        let (bob, _bob_rx) = connection(2);

        groups.create("team", &alice).expect("create");
        assert_eq!(
            groups.create("team", &bob),
            Err(GroupError::AlreadyExists("team".into()))
        );
        assert_eq!(groups.members("team"), Some(vec![1]));
    }

    #[test]
    fn join_notifies_existing_members_and_rejects_repeat() {
        let groups = GroupRegistry::new();
        let (alice, mut alice_rx) = connection(1);
        let (bob, mut bob_rx) = connection(2);

        groups.create("team", &alice).expect("create");
        groups
            .join("team", &bob, "bob joined the group team.")
            .expect("join");
        assert_eq!(
            groups.join("team", &bob, "bob joined the group team."),
            Err(GroupError::AlreadyMember("team".into()))
        );
        assert_eq!(
            groups.join("nope", &bob, "ignored"),
            Err(GroupError::NotFound("nope".into()))
        );

        assert_eq!(drain(&mut alice_rx), vec!["bob joined the group team.\n"]);
        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(groups.members("team"), Some(vec![1, 2]));
    }

    #[test]
    fn join_then_leave_restores_membership_and_deletes_empty_group() {
        let groups = GroupRegistry::new();
        let (alice, mut alice_rx) = connection(1);
        let (bob, _bob_rx) = connection(2);

        groups.create("team", &alice).expect("create");
        groups.join("team", &bob, "bob joined").expect("join");
        drain(&mut alice_rx);

        assert_eq!(groups.leave("team", 2, "bob left"), Ok(false));
        assert_eq!(groups.members("team"), Some(vec![1]));
        assert_eq!(drain(&mut alice_rx), vec!["bob left\n"]);

        assert_eq!(
            groups.leave("team", 2, "bob left"),
            Err(GroupError::NotInGroup("team".into()))
        );
        assert_eq!(groups.leave("team", 1, "alice left"), Ok(true));
        assert!(!groups.contains("team"));
        assert_eq!(
            groups.join("team", &bob, "bob joined"),
            Err(GroupError::NotFound("team".into()))
        );
    }

    #[test]
    fn group_send_requires_membership_and_skips_sender() {
        let groups = GroupRegistry::new();
        let (alice, mut alice_rx) = connection(1);
        let (bob, mut bob_rx) = connection(2);
        let (_carol, mut carol_rx) = connection(3);

        groups.create("team", &alice).expect("create");
        groups.join("team", &bob, "bob joined").expect("join");
        drain(&mut alice_rx);

        assert_eq!(groups.send("team", 2, "[bob][Group team]: hi"), Ok(1));
        assert_eq!(
            groups.send("team", 3, "[carol][Group team]: hi"),
            Err(GroupError::NotMember("team".into()))
        );
        assert_eq!(
            groups.send("other", 1, "x"),
            Err(GroupError::NotFound("other".into()))
        );

        assert_eq!(drain(&mut alice_rx), vec!["[bob][Group team]: hi\n"]);
        assert!(drain(&mut bob_rx).is_empty());
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[test]
    fn remove_member_cleans_every_group() {
        let groups = GroupRegistry::new();
        let (alice, _alice_rx) = connection(1);
        let (bob, _bob_rx) = connection(2);

        groups.create("solo", &bob).expect("solo");
        groups.create("team", &alice).expect("team");
        groups.join("team", &bob, "bob joined").expect("join");

        assert_eq!(groups.remove_member(2), vec!["solo", "team"]);
        assert!(!groups.contains("solo"));
        assert_eq!(groups.members("team"), Some(vec![1]));
        assert!(groups.remove_member(2).is_empty());
    }
}
