//! Channel entities.
//!
//! Membership is reciprocal with [`crate::client::Client::channels`]: for
//! every member handle in `members`, that client's channel set contains
//! this channel, and vice versa. A channel is created on first join and
//! freed when the last member leaves.

use std::collections::BTreeSet;

/// A named multicast group of clients.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub created_ts: u64,
    pub topic: Option<Topic>,
    /// Member client handles, ordered for deterministic fan-out.
    pub members: BTreeSet<usize>,
    pub ops: BTreeSet<usize>,
    pub voiced: BTreeSet<usize>,
    pub bans: Vec<BanEntry>,
    pub invites: BTreeSet<usize>,
    /// +t: only ops may set the topic.
    pub topic_locked: bool,
    /// +i: invite only.
    pub invite_only: bool,
    /// +n: no messages from outside the channel.
    pub no_external: bool,
    /// +k: join key.
    pub key: Option<String>,
}

impl Channel {
    pub fn new(name: String, created_ts: u64) -> Self {
        Self {
            name,
            created_ts,
            topic: None,
            members: BTreeSet::new(),
            ops: BTreeSet::new(),
            voiced: BTreeSet::new(),
            bans: Vec::new(),
            invites: BTreeSet::new(),
            topic_locked: true,
            invite_only: false,
            no_external: true,
            key: None,
        }
    }

    /// Mode string in `+nt`-style display form.
    pub fn mode_string(&self) -> String {
        let mut modes = String::from("+");
        if self.no_external {
            modes.push('n');
        }
        if self.topic_locked {
            modes.push('t');
        }
        if self.invite_only {
            modes.push('i');
        }
        if self.key.is_some() {
            modes.push('k');
        }
        modes
    }

    /// Check if a user is banned from this channel.
    pub fn is_banned(&self, hostmask: &str) -> bool {
        self.bans.iter().any(|b| b.matches(hostmask))
    }

    pub fn has_topic(&self) -> bool {
        self.topic.is_some()
    }
}

/// Channel topic with metadata.
#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: u64,
}

/// A ban entry: a wildcard pattern matched against `nick!user@host`.
#[derive(Debug, Clone)]
pub struct BanEntry {
    pub mask: String,
    pub set_by: String,
    pub set_at: u64,
}

impl BanEntry {
    pub fn new(mask: String, set_by: String, set_at: u64) -> Self {
        Self {
            mask,
            set_by,
            set_at,
        }
    }

    /// Match the mask against a `nick!user@host`, case-insensitively.
    /// `*` spans any run of bytes, `?` exactly one.
    pub fn matches(&self, hostmask: &str) -> bool {
        let pattern = self.mask.as_bytes();
        let text = hostmask.as_bytes();
        let (mut p, mut t) = (0, 0);
        // most recent `*` and the text position it has consumed up to
        let mut star: Option<(usize, usize)> = None;
        while t < text.len() {
            if p < pattern.len()
                && (pattern[p] == b'?' || pattern[p].eq_ignore_ascii_case(&text[t]))
            {
                p += 1;
                t += 1;
            } else if p < pattern.len() && pattern[p] == b'*' {
                star = Some((p, t));
                p += 1;
            } else if let Some((sp, st)) = star {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            } else {
                return false;
            }
        }
        while p < pattern.len() && pattern[p] == b'*' {
            p += 1;
        }
        p == pattern.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_wildcard_matching() {
        let ban = BanEntry::new("*!*@10.0.0.*".to_string(), "op".to_string(), 0);
        assert!(ban.matches("alice!~a@10.0.0.7"));
        assert!(!ban.matches("alice!~a@192.168.0.7"));
    }

    #[test]
    fn ban_question_mark_matches_one_byte() {
        let ban = BanEntry::new("alice?!*@*".to_string(), "op".to_string(), 0);
        assert!(ban.matches("alice2!~a@host"));
        assert!(!ban.matches("alice!~a@host"));
        assert!(!ban.matches("alice22!~a@host"));
    }

    #[test]
    fn ban_matching_is_case_insensitive() {
        let ban = BanEntry::new("Alice!*@*".to_string(), "op".to_string(), 0);
        assert!(ban.matches("alice!~a@host"));
    }

    #[test]
    fn mode_string_reflects_flags() {
        let mut ch = Channel::new("#x".to_string(), 100);
        assert_eq!(ch.mode_string(), "+nt");
        ch.invite_only = true;
        ch.key = Some("pw".to_string());
        assert_eq!(ch.mode_string(), "+ntik");
        ch.topic_locked = false;
        ch.no_external = false;
        assert_eq!(ch.mode_string(), "+ik");
    }
}
