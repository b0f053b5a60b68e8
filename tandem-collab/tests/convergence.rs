//! Randomized convergence: one session, several replicas, messages delivered
//! in arbitrary interleavings. No network; every queue is explicit.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem_collab::operation::{Edit, TextOperation};
use tandem_collab::protocol::{ClientId, ClientMessage, RemoteOperation, ServerMessage, SessionId, UserData};
use tandem_collab::replica::Replica;
use tandem_collab::session::{Outbound, Session};

const ALPHABET: &[char] = &['a', 'b', 'c', ' ', '\n', 'é', '🙂'];

struct Peer {
    id: ClientId,
    replica: Replica,
    inbox: VecDeque<ServerMessage>,
}

struct World {
    session: Session,
    peers: Vec<Peer>,
    /// Client → sequencer, in arrival order.
    uplink: VecDeque<(ClientId, ClientMessage)>,
    /// Session content at each revision.
    history: Vec<String>,
}

impl World {
    fn new(content: &str, members: usize) -> Self {
        let session_id = SessionId::new("sim");
        let mut world = Self {
            session: Session::new(session_id.clone(), content, members),
            peers: Vec::new(),
            uplink: VecDeque::new(),
            history: vec![content.to_string()],
        };
        for n in 0..members {
            let id = ClientId::new();
            world.peers.push(Peer { id, replica: Replica::join(session_id.clone()), inbox: VecDeque::new() });
            let batch = world.session.join(id, &UserData::named(format!("peer{n}"))).unwrap();
            world.route(batch);
        }
        world.settle();
        world
    }

    fn route(&mut self, batch: Vec<Outbound>) {
        for out in batch {
            for peer in &mut self.peers {
                if out.to.includes(&peer.id) {
                    peer.inbox.push_back(out.message.clone());
                }
            }
        }
    }

    fn sequence_one(&mut self) -> bool {
        let Some((from, message)) = self.uplink.pop_front() else {
            return false;
        };
        let batch = self.session.handle(from, message);
        if self.session.revision() as usize == self.history.len() {
            self.history.push(self.session.content().to_string());
        }
        self.route(batch);
        true
    }

    /// Queue a local edit on peer `index`, sending it if one comes out.
    fn type_on(&mut self, index: usize, next: &str) {
        let peer = &mut self.peers[index];
        if let Some(message) = peer.replica.local_edit(next) {
            self.uplink.push_back((peer.id, message));
        }
    }

    /// An operation far ahead of anything sequenced; the peer must resync.
    fn inject_gap(&mut self, index: usize) {
        let author = self.peers[(index + 1) % self.peers.len()].id;
        self.peers[index].inbox.push_back(ServerMessage::Operation(RemoteOperation {
            operation: TextOperation::new(Edit::insert(0, "zzz"), 999_999),
            revision: 1_000_000,
            client_id: author,
        }));
    }

    fn deliver_one(&mut self, index: usize) -> bool {
        let peer = &mut self.peers[index];
        let Some(message) = peer.inbox.pop_front() else {
            return false;
        };
        let reaction = peer.replica.handle(message);
        assert!(!reaction.stop);
        if let Some(reply) = reaction.reply {
            self.uplink.push_back((peer.id, reply));
        }
        true
    }

    fn settle(&mut self) {
        loop {
            let mut progressed = self.sequence_one();
            for i in 0..self.peers.len() {
                while self.deliver_one(i) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Every peer's confirmed text is what the session held at that revision.
    fn assert_confirmed_matches_history(&self) {
        for peer in &self.peers {
            let revision = peer.replica.revision() as usize;
            assert_eq!(peer.replica.document().confirmed(), self.history[revision]);
        }
    }

    fn assert_converged(&self) {
        for peer in &self.peers {
            assert_eq!(peer.replica.content(), self.session.content());
            assert_eq!(peer.replica.revision(), self.session.revision());
            assert!(!peer.replica.document().has_pending());
        }
    }
}

fn random_edit(rng: &mut StdRng, text: &str) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    match rng.gen_range(0..3) {
        0 => {
            let at = rng.gen_range(0..=len);
            let ch = ALPHABET[rng.gen_range(0..ALPHABET.len())];
            chars.insert(at, ch);
        }
        1 if len > 0 => {
            let start = rng.gen_range(0..len);
            let end = rng.gen_range(start..=len.min(start + 3));
            chars.drain(start..end);
        }
        _ => {
            let start = rng.gen_range(0..=len);
            let end = rng.gen_range(start..=len);
            let ch = ALPHABET[rng.gen_range(0..ALPHABET.len())];
            chars.splice(start..end, [ch, ch]);
        }
    }
    chars.into_iter().collect()
}

fn run(seed: u64, members: usize, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut world = World::new("hello world", members);

    for _ in 0..steps {
        match rng.gen_range(0..20) {
            0..=7 => {
                let i = rng.gen_range(0..members);
                let next = random_edit(&mut rng, world.peers[i].replica.content());
                world.type_on(i, &next);
            }
            8..=11 => {
                world.sequence_one();
            }
            12 => {
                // prefer a peer whose ops are still in flight
                let i = world
                    .uplink
                    .back()
                    .and_then(|(from, _)| world.peers.iter().position(|p| p.id == *from))
                    .unwrap_or_else(|| rng.gen_range(0..members));
                world.inject_gap(i);
            }
            _ => {
                let i = rng.gen_range(0..members);
                world.deliver_one(i);
            }
        }
        world.assert_confirmed_matches_history();
    }

    world.settle();
    world.assert_confirmed_matches_history();
    world.assert_converged();
}

#[test]
fn test_two_replicas_converge() {
    for seed in 0..50 {
        run(seed, 2, 200);
    }
}

#[test]
fn test_many_replicas_converge() {
    for seed in 100..120 {
        run(seed, 5, 400);
    }
}

#[test]
fn test_stale_edits_are_sequenced_against_current_content() {
    let mut world = World::new("hello", 2);

    // Both edit revision 0 before hearing of each other.
    let a = world.peers[0].replica.local_edit("hello!").unwrap();
    let b = world.peers[1].replica.local_edit("hell").unwrap();
    world.uplink.push_back((world.peers[0].id, a));
    world.uplink.push_back((world.peers[1].id, b));

    world.settle();
    world.assert_converged();
    assert_eq!(world.session.revision(), 2);
    assert_eq!(world.session.content(), "hell!");
}

#[test]
fn test_gap_triggers_resync() {
    let mut world = World::new("abc", 2);
    let bogus = ServerMessage::Operation(RemoteOperation {
        operation: TextOperation::new(Edit::insert(0, "zzz"), 5),
        revision: 7,
        client_id: world.peers[1].id,
    });
    world.peers[0].inbox.push_back(bogus);

    world.settle();
    world.assert_converged();
    assert_eq!(world.peers[0].replica.content(), "abc");
}

#[test]
fn test_resync_while_own_ops_are_in_flight() {
    let mut world = World::new("abc", 2);

    world.type_on(0, "abcd");
    world.type_on(0, "abcde");
    world.inject_gap(0);

    // Peer 0 hears of the gap before any of its ops are sequenced.
    assert!(world.deliver_one(0));
    assert!(world.peers[0].replica.is_resyncing());
    world.assert_confirmed_matches_history();

    // Typed during the resync: held, not sent.
    let queued = world.uplink.len();
    world.type_on(0, "abcdef");
    assert_eq!(world.uplink.len(), queued);
    assert_eq!(world.peers[0].replica.content(), "abcdef");

    while world.sequence_one() {
        world.assert_confirmed_matches_history();
        for i in 0..world.peers.len() {
            while world.deliver_one(i) {
                world.assert_confirmed_matches_history();
            }
        }
    }

    world.settle();
    world.assert_converged();
    assert_eq!(world.session.content(), "abcdef");
    assert_eq!(world.session.revision(), 3);
    assert!(!world.peers[0].replica.is_resyncing());
}
