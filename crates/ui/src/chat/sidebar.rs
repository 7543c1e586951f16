use std::collections::{BTreeSet, HashMap};

use firechat_identity::User;
use firechat_storage::{MessageSet, UserId};

use crate::chat::message::counterparts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub uid: UserId,
    /// `None` until the counterpart's profile has been resolved.
    pub user: Option<User>,
}

impl PeerEntry {
    pub fn label(&self) -> String {
        match &self.user {
            Some(user) => user.label().to_string(),
            None => self.uid.to_string(),
        }
    }

    fn sort_key(&self) -> String {
        match &self.user {
            Some(user) => user.email.clone(),
            None => self.uid.to_string(),
        }
    }
}

/// Peer list of the signed-in user: peers added this session plus counterparts of the
/// current snapshot.
#[derive(Debug)]
pub struct PeerSidebar {
    current: UserId,
    added: BTreeSet<UserId>,
    counterparts: Vec<UserId>,
    profiles: HashMap<UserId, User>,
    selected: Option<UserId>,
    search_results: Vec<User>,
}

impl PeerSidebar {
    pub fn new(current: UserId) -> Self {
        Self {
            current,
            added: BTreeSet::new(),
            counterparts: Vec::new(),
            profiles: HashMap::new(),
            selected: None,
            search_results: Vec::new(),
        }
    }

    /// Returns false when `user` is the signed-in user.
    pub fn add_peer(&mut self, user: User) -> bool {
        if user.uid == self.current {
            return false;
        }

        self.added.insert(user.uid);
        self.profiles.insert(user.uid, user);
        true
    }

    /// Records the counterparts of a new snapshot and returns those without a known profile.
    pub fn sync_snapshot(&mut self, set: &MessageSet) -> Vec<UserId> {
        self.counterparts = counterparts(set, self.current);
        self.counterparts
            .iter()
            .filter(|uid| !self.profiles.contains_key(uid))
            .copied()
            .collect()
    }

    pub fn remember(&mut self, user: User) {
        if user.uid != self.current {
            self.profiles.insert(user.uid, user);
        }
    }

    pub fn peers(&self) -> Vec<PeerEntry> {
        let uids = self
            .added
            .iter()
            .chain(self.counterparts.iter())
            .copied()
            .filter(|uid| *uid != self.current)
            .collect::<BTreeSet<_>>();

        let mut entries = uids
            .into_iter()
            .map(|uid| PeerEntry {
                uid,
                user: self.profiles.get(&uid).cloned(),
            })
            .collect::<Vec<_>>();
        entries.sort_by_key(PeerEntry::sort_key);
        entries
    }

    /// Selects a listed peer. Returns false when `uid` is not in the list.
    pub fn select(&mut self, uid: UserId) -> bool {
        if uid == self.current || !self.peers().iter().any(|entry| entry.uid == uid) {
            return false;
        }

        self.selected = Some(uid);
        true
    }

    /// Resolves a listed peer by case-insensitive email.
    pub fn find_by_email(&self, email: &str) -> Option<UserId> {
        let email = email.trim();
        self.peers()
            .into_iter()
            .find(|entry| {
                entry
                    .user
                    .as_ref()
                    .is_some_and(|user| user.email.eq_ignore_ascii_case(email))
            })
            .map(|entry| entry.uid)
    }

    pub fn selected(&self) -> Option<UserId> {
        self.selected
    }

    pub fn selected_peer(&self) -> Option<PeerEntry> {
        let uid = self.selected?;
        Some(PeerEntry {
            uid,
            user: self.profiles.get(&uid).cloned(),
        })
    }

    pub fn set_search_results(&mut self, results: Vec<User>) {
        self.search_results = results
            .into_iter()
            .filter(|user| user.uid != self.current)
            .collect();
    }

    pub fn search_results(&self) -> &[User] {
        &self.search_results
    }
}
