// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios over a simulated chat room.
//!
//! The room broadcasts every string to all listed members in one total order and echoes
//! broadcasts back to their senders, which is exactly the transport contract the engine assumes.
use std::collections::BTreeMap;

use crate::crypto::identity::{PrivateKey, PublicKey};
use crate::crypto::sha2::sha2_256;
use crate::crypto::triple_dh::triple_dh;
use crate::crypto::Rng;
use crate::message::{self, Body, RosterEntry};
use crate::ops::{RoomAction, TimerKind};
use crate::participant::{ParticipantId, UnauthenticatedParticipant};
use crate::session::{link_key, xor_keys};
use crate::test_utils::RecordingOps;
use crate::user_state::UserState;

const ROOM: &str = "jazz";

struct Network {
    users: Vec<UserState<RecordingOps>>,
    next_message_id: u32,
}

impl Network {
    fn new() -> Self {
        Self {
            users: Vec::new(),
            next_message_id: 0,
        }
    }

    fn add_user(&mut self, name: &str, seed: [u8; 32]) -> usize {
        let user = UserState::new_seeded(name, RecordingOps::new(), seed).unwrap();
        self.users.push(user);
        self.users.len() - 1
    }

    fn user(&self, index: usize) -> &UserState<RecordingOps> {
        &self.users[index]
    }

    /// Collects pending broadcasts from every member in index order.
    fn collect(&mut self) -> Vec<String> {
        let mut queue = Vec::new();
        for user in &mut self.users {
            for (room, _sender, payload) in user.ops_mut().drain_sent() {
                assert_eq!(room, ROOM);
                queue.push(payload);
            }
        }
        queue
    }

    /// Broadcasts one payload to the listed members under a fresh message id.
    fn deliver_to(&mut self, payload: &str, members: &[usize]) -> Vec<(usize, RoomAction)> {
        let message_id = self.next_message_id;
        self.next_message_id += 1;
        let mut actions = Vec::new();
        for &index in members {
            let action = self.users[index].receive(ROOM, payload, message_id);
            if action != RoomAction::None {
                actions.push((index, action));
            }
        }
        actions
    }

    /// Runs the room among the listed members until nobody has anything left to broadcast.
    fn pump_among(&mut self, members: &[usize]) -> Vec<(usize, RoomAction)> {
        let mut actions = Vec::new();
        loop {
            let queue = self.collect();
            if queue.is_empty() {
                break;
            }
            for payload in queue {
                actions.extend(self.deliver_to(&payload, members));
            }
        }
        actions
    }

    /// Runs the room with everybody present.
    fn pump(&mut self) -> Vec<(usize, RoomAction)> {
        let everyone: Vec<usize> = (0..self.users.len()).collect();
        self.pump_among(&everyone)
    }

    /// Expires an armed timer the way a host event loop would.
    fn fire_timer(&mut self, index: usize, kind: TimerKind, peer: Option<&str>) -> RoomAction {
        let (handle, event) = self.users[index]
            .ops()
            .timers
            .iter()
            .find(|(_, (event, _))| event.kind == kind && event.peer.as_deref() == peer)
            .map(|(handle, (event, _))| (*handle, event.clone()))
            .expect("timer is armed");
        self.users[index].ops_mut().timers.remove(&handle);
        self.users[index].timer_fired(&event)
    }
}

/// The roster entry a host would build for the joining user themselves.
///
/// The engine replaces it with a fresh ephemeral key, so any valid point serves here.
fn self_entry(user: &UserState<RecordingOps>) -> UnauthenticatedParticipant {
    UnauthenticatedParticipant {
        id: ParticipantId::new(user.nickname(), user.identity_key()),
        ephemeral_key: user.identity_key(),
    }
}

/// Joins the room with the roster advertised by an incumbent (or alone).
fn join(network: &mut Network, index: usize, incumbent: Option<usize>) {
    let mut roster = incumbent
        .and_then(|other| network.user(other).room_roster(ROOM))
        .unwrap_or_default();
    roster.push(self_entry(network.user(index)));
    network.users[index].join_room(ROOM, &roster).unwrap();
}

fn members_of(network: &Network, index: usize) -> Vec<String> {
    network.user(index).room_members(ROOM).unwrap()
}

#[test]
fn two_party_join_and_chat() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);

    // Alice enters the empty room and is established on her own.
    join(&mut network, alice, None);
    assert_eq!(members_of(&network, alice), vec!["alice"]);

    // Bob requests to join with the roster Alice's host advertises.
    join(&mut network, bob, Some(alice));
    network.pump();

    assert_eq!(members_of(&network, alice), vec!["alice", "bob"]);
    assert_eq!(members_of(&network, bob), vec!["alice", "bob"]);
    assert_eq!(
        network.user(alice).active_session_id(ROOM),
        network.user(bob).active_session_id(ROOM),
    );
    assert!(network
        .user(alice)
        .ops()
        .joined
        .contains(&(ROOM.to_owned(), "bob".to_owned())));

    // Bob chats; Alice's display callback receives the plaintext.
    network.users[bob].send(ROOM, "hello").unwrap();
    network.pump();
    assert_eq!(
        network.user(alice).ops().displayed,
        vec![(ROOM.to_owned(), "hello".to_owned())]
    );
}

#[test]
fn tampered_joiner_auth_kills_only_the_target_session() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();

    // Eve is driven by hand: she follows the protocol except for one forged token.
    let rng = Rng::from_seed([9; 32]);
    let eve_longterm = PrivateKey::from_rng(&rng).unwrap();
    let eve_ephemeral = PrivateKey::from_rng(&rng).unwrap();
    let eve_id = ParticipantId::new("eve", eve_longterm.public_key());

    let join_request = message::encode(
        None,
        "eve",
        &Body::JoinRequest {
            joiner: RosterEntry::new(&eve_id, &eve_ephemeral.public_key()),
        },
        &eve_ephemeral,
    )
    .unwrap();
    network.deliver_to(&join_request, &[alice, bob]);

    // Both incumbents reply with their session view.
    let replies = network.collect();
    assert_eq!(replies.len(), 2);
    let info = message::decode(&replies[0]).unwrap();
    let session_id = info.session_id.unwrap();
    let Body::ParticipantInfo { roster, .. } = info.body else {
        panic!("expected participant info");
    };
    for reply in &replies {
        network.deliver_to(reply, &[alice, bob]);
    }

    // Eve derives her genuine pairwise secrets and a consistent key share from the view.
    let entry = |nickname: &str| {
        roster
            .iter()
            .find(|entry| entry.nickname == nickname)
            .unwrap()
    };
    let p2p = |entry: &RosterEntry| {
        let longterm = PublicKey::from_bytes(&entry.long_term_key).unwrap();
        let ephemeral = PublicKey::from_bytes(&entry.ephemeral_key).unwrap();
        triple_dh(
            &ephemeral,
            &longterm,
            &eve_longterm,
            &eve_ephemeral,
            longterm < eve_longterm.public_key(),
        )
    };
    let p2p_alice = p2p(entry("alice"));
    let p2p_bob = p2p(entry("bob"));

    // Index order is alice(0), bob(1), eve(2); Eve sits between her links with bob and alice.
    let key_share = xor_keys(
        &link_key(&p2p_bob, &session_id),
        &link_key(&p2p_alice, &session_id),
    );

    // A correct token for Bob, a forged one for Alice.
    let mut auth_tokens = BTreeMap::new();
    auth_tokens.insert(0u32, [0u8; 32]);
    auth_tokens.insert(1u32, sha2_256(&[p2p_bob.as_bytes(), &eve_id.to_bytes()]));

    let joiner_auth = message::encode(
        Some(&session_id),
        "eve",
        &Body::JoinerAuth {
            auth_tokens,
            key_share,
        },
        &eve_ephemeral,
    )
    .unwrap();
    let actions = network.deliver_to(&joiner_auth, &[alice, bob]);

    // Alice warns that the session with Eve can not be trusted.
    assert!(actions.iter().any(|(index, action)| {
        *index == alice
            && matches!(action, RoomAction::Display(message) if message.contains("failed authentication"))
    }));

    // Bob's session with Eve is fine as far as he can tell, but without Alice it never
    // completes: nobody is promoted and the established pair keeps working.
    network.pump();
    assert_eq!(members_of(&network, alice), vec!["alice", "bob"]);
    assert_eq!(members_of(&network, bob), vec!["alice", "bob"]);

    network.users[bob].send(ROOM, "still here").unwrap();
    network.pump();
    assert!(network
        .user(alice)
        .ops()
        .displayed
        .contains(&(ROOM.to_owned(), "still here".to_owned())));
}

#[test]
fn leave_rekeys_the_group() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);
    let carol = network.add_user("carol", [3; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();
    join(&mut network, carol, Some(alice));
    network.pump();

    assert_eq!(members_of(&network, alice), vec!["alice", "bob", "carol"]);
    assert_eq!(members_of(&network, carol), vec!["alice", "bob", "carol"]);
    let old_session = network.user(alice).active_session_id(ROOM).unwrap();

    // Bob says farewell; the survivors re-share and confirm a fresh key.
    network.users[bob].leave_room(ROOM).unwrap();
    network.pump();

    assert_eq!(members_of(&network, alice), vec!["alice", "carol"]);
    assert_eq!(members_of(&network, carol), vec!["alice", "carol"]);
    let new_session = network.user(alice).active_session_id(ROOM).unwrap();
    assert_ne!(old_session, new_session);
    assert_eq!(
        network.user(carol).active_session_id(ROOM),
        Some(new_session)
    );
    assert!(network
        .user(alice)
        .ops()
        .left
        .contains(&(ROOM.to_owned(), "bob".to_owned())));

    // The new epoch excludes Bob.
    network.users[alice].send(ROOM, "without bob").unwrap();
    network.pump();
    assert!(network
        .user(carol)
        .ops()
        .displayed
        .contains(&(ROOM.to_owned(), "without bob".to_owned())));
    assert!(!network
        .user(bob)
        .ops()
        .displayed
        .contains(&(ROOM.to_owned(), "without bob".to_owned())));
}

#[test]
fn sole_survivor_reestablishes_alone() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();

    network.users[bob].leave_room(ROOM).unwrap();
    network.pump();

    assert_eq!(members_of(&network, alice), vec!["alice"]);
    assert!(network
        .user(alice)
        .ops()
        .left
        .contains(&(ROOM.to_owned(), "bob".to_owned())));
    assert!(network.users[alice].send(ROOM, "anyone?").is_ok());
}

#[test]
fn transport_leave_notice_triggers_rekey() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);
    let carol = network.add_user("carol", [3; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();
    join(&mut network, carol, Some(alice));
    network.pump();

    // Bob drops off the transport without a farewell; the room notices.
    network.deliver_to(":o?LEAVE:o?bob", &[alice, carol]);
    network.pump_among(&[alice, carol]);

    assert_eq!(members_of(&network, alice), vec!["alice", "carol"]);
    assert_eq!(members_of(&network, carol), vec!["alice", "carol"]);
    assert_eq!(
        network.user(alice).active_session_id(ROOM),
        network.user(carol).active_session_id(ROOM),
    );
}

#[test]
fn stale_join_view_respawns_with_observed_view() {
    let mut network = Network::new();
    let bob = network.add_user("bob", [2; 32]);
    let alice = network.add_user("alice", [1; 32]);

    join(&mut network, bob, None);

    // Alice's host hands her a stale roster which still lists carol.
    let rng = Rng::from_seed([7; 32]);
    let carol_key = PrivateKey::from_rng(&rng).unwrap();
    let mut roster = network.user(bob).room_roster(ROOM).unwrap();
    roster.push(UnauthenticatedParticipant {
        id: ParticipantId::new("carol", carol_key.public_key()),
        ephemeral_key: carol_key.public_key(),
    });
    roster.push(self_entry(network.user(alice)));
    network.users[alice].join_room(ROOM, &roster).unwrap();

    // Bob's reply carries the session id of the real room view; Alice's first session can not
    // match it and a sibling with the observed view takes over.
    network.pump();

    assert_eq!(members_of(&network, alice), vec!["alice", "bob"]);
    assert_eq!(members_of(&network, bob), vec!["alice", "bob"]);
    assert_eq!(
        network.user(alice).active_session_id(ROOM),
        network.user(bob).active_session_id(ROOM),
    );

    network.users[alice].send(ROOM, "made it").unwrap();
    network.pump();
    assert!(network
        .user(bob)
        .ops()
        .displayed
        .contains(&(ROOM.to_owned(), "made it".to_owned())));
}

#[test]
fn replayed_stale_message_is_not_delivered() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();

    network.users[bob].send(ROOM, "one").unwrap();
    let queue = network.collect();
    assert_eq!(queue.len(), 1);
    let first = queue[0].clone();
    network.deliver_to(&first, &[alice, bob]);

    network.users[bob].send(ROOM, "two").unwrap();
    network.pump();
    assert_eq!(
        network.user(alice).ops().displayed,
        vec![
            (ROOM.to_owned(), "one".to_owned()),
            (ROOM.to_owned(), "two".to_owned()),
        ]
    );

    // Mallory replays the first frame; its chain head is stale by now.
    let actions = network.deliver_to(&first, &[alice, bob]);
    assert!(actions.iter().any(|(index, action)| {
        *index == alice
            && matches!(action, RoomAction::Display(message) if message.contains("transcript inconsistency"))
    }));
    assert_eq!(network.user(alice).ops().displayed.len(), 2);

    // No state changed; the conversation continues.
    network.users[alice].send(ROOM, "three").unwrap();
    network.pump();
    assert!(network
        .user(bob)
        .ops()
        .displayed
        .contains(&(ROOM.to_owned(), "three".to_owned())));
}

#[test]
fn heartbeat_refreshes_ack_expectations() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();

    network.users[bob].send(ROOM, "hi").unwrap();
    network.pump();

    // Bob expects an acknowledgement from Alice; Alice owes one.
    assert!(network
        .user(bob)
        .ops()
        .timer(TimerKind::AckAwait, Some("alice"))
        .is_some());
    assert!(network
        .user(alice)
        .ops()
        .timer(TimerKind::AckSend, None)
        .is_some());

    // Alice stays silent until her heartbeat fires.
    network.fire_timer(alice, TimerKind::Heartbeat, None);
    network.pump();

    // The heartbeat was rearmed, it settled Alice's debt and Bob's expectation.
    assert!(network
        .user(alice)
        .ops()
        .timer(TimerKind::Heartbeat, None)
        .is_some());
    assert!(network
        .user(alice)
        .ops()
        .timer(TimerKind::AckSend, None)
        .is_none());
    assert!(network
        .user(bob)
        .ops()
        .timer(TimerKind::AckAwait, Some("alice"))
        .is_none());
}

#[test]
fn ack_query_is_answered() {
    let mut network = Network::new();
    let alice = network.add_user("alice", [1; 32]);
    let bob = network.add_user("bob", [2; 32]);

    join(&mut network, alice, None);
    join(&mut network, bob, Some(alice));
    network.pump();

    network.users[bob].send(ROOM, "hi").unwrap();
    network.pump();

    // Alice never acknowledges; Bob's patience runs out and he asks.
    let action = network.fire_timer(bob, TimerKind::AckAwait, Some("alice"));
    assert!(matches!(action, RoomAction::Display(message) if message.contains("not responding")));
    network.pump();

    // Alice's ack settled the query; her own pending ack-send is gone as well.
    assert!(network
        .user(alice)
        .ops()
        .timer(TimerKind::AckSend, None)
        .is_none());
}
