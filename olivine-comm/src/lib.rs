//! Process-group communication kernel for `olivine`.
//!
//! The distributed assembly and gather code is written against the
//! [`Communicator`] trait: a fixed-size group of ranks exchanging tagged,
//! length-prefixed arrays through non-blocking point-to-point messages and a
//! small set of collectives. Collectives are synchronization points and must
//! be invoked in the same order on every rank of the group.
//!
//! Two implementations ship with this crate:
//!
//! - [`SingleProcess`]: the trivial group of one rank. All collectives are
//!   identities and there are no peers to message.
//! - [`LocalComm`]: `n` ranks living in one process (one per thread), backed
//!   by shared mailboxes. This is what the test suite drives; a deployment on
//!   top of a real message-passing runtime binds the same trait to its
//!   communicator instead.
//!
//! Messages between a fixed (source, destination, tag) triple are delivered
//! in posting order, so two message kinds in flight between the same pair of
//! ranks are kept apart by their tags.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A message-kind tag.
///
/// Receives match on (source, tag); payloads with different tags never
/// satisfy each other's posted receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTag(pub u16);

/// Scalar kinds that can travel between ranks.
///
/// The in-process transport moves payloads by ownership transfer, so any
/// sendable `'static` type qualifies. A binding to a real message-passing
/// runtime would narrow this to its wire-representable scalars.
pub trait Payload: Send + 'static {}

impl<T: Send + 'static> Payload for T {}

#[derive(Debug)]
pub enum CommError {
    /// The target rank does not exist in this group.
    InvalidRank { rank: usize, size: usize },
    /// A received payload's length disagreed with the posted receive.
    LengthMismatch { expected: usize, actual: usize },
    /// The group's accounting was violated (wrong collective payload shape,
    /// mismatched payload type, re-entered round). Indicates a bug in the
    /// caller's exchange logic, not a recoverable runtime condition.
    Protocol(String),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::InvalidRank { rank, size } => {
                write!(f, "rank {} is outside the group of size {}", rank, size)
            }
            CommError::LengthMismatch { expected, actual } => write!(
                f,
                "received payload of length {} where {} was posted",
                actual, expected
            ),
            CommError::Protocol(what) => write!(f, "communication protocol violation: {}", what),
        }
    }
}

impl Error for CommError {}

/// Handle to an in-flight non-blocking send.
pub trait SendHandle {
    /// Returns `true` once the payload has been handed off to the transport.
    fn test(&mut self) -> Result<bool, CommError>;

    /// Blocks until the payload has been handed off.
    fn wait(self) -> Result<(), CommError>;
}

/// Handle to a posted non-blocking receive of a `Vec<T>` payload.
pub trait RecvHandle<T> {
    /// Polls for completion, returning the payload the first time it has
    /// arrived and `None` while it is still in flight.
    fn test(&mut self) -> Result<Option<Vec<T>>, CommError>;

    /// Blocks until the payload arrives.
    fn wait(self) -> Result<Vec<T>, CommError>;
}

/// A fixed-size group of cooperating ranks.
pub trait Communicator {
    type SendRequest: SendHandle;
    type RecvRequest<T: Payload>: RecvHandle<T>;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Exchanges one integer with every rank: entry `j` of the argument is
    /// delivered to rank `j`, and entry `j` of the result came from rank `j`.
    /// Collective; the argument's length must equal the group size.
    fn all_to_all_counts(&self, send_counts: &[usize]) -> Result<Vec<usize>, CommError>;

    /// Logical OR across the group. Collective.
    fn all_reduce_or(&self, value: bool) -> Result<bool, CommError>;

    /// Sum across the group. Collective.
    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError>;

    /// Posts a non-blocking send of `data` to `dest`.
    fn isend<T: Payload>(
        &self,
        data: Vec<T>,
        dest: usize,
        tag: MessageTag,
    ) -> Result<Self::SendRequest, CommError>;

    /// Posts a non-blocking receive of exactly `len` values from `src`.
    fn irecv<T: Payload>(
        &self,
        src: usize,
        tag: MessageTag,
        len: usize,
    ) -> Result<Self::RecvRequest<T>, CommError>;

    /// Blocking receive of exactly `len` values from `src`.
    fn recv<T: Payload>(
        &self,
        src: usize,
        tag: MessageTag,
        len: usize,
    ) -> Result<Vec<T>, CommError> {
        self.irecv(src, tag, len)?.wait()
    }
}

/// The group of one rank.
///
/// There are no peers, so point-to-point operations are rejected; code with a
/// single-rank fast path never reaches them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl SingleProcess {
    pub fn new() -> Self {
        SingleProcess
    }
}

/// Send handle whose transfer completed at posting time.
#[derive(Debug)]
pub struct ReadySend(());

impl SendHandle for ReadySend {
    fn test(&mut self) -> Result<bool, CommError> {
        Ok(true)
    }

    fn wait(self) -> Result<(), CommError> {
        Ok(())
    }
}

/// Receive handle that can never be satisfied; only constructed on error
/// paths that are unreachable for well-formed callers.
pub struct NeverRecv<T>(std::marker::PhantomData<T>);

impl<T> RecvHandle<T> for NeverRecv<T> {
    fn test(&mut self) -> Result<Option<Vec<T>>, CommError> {
        Err(CommError::Protocol(
            "receive posted in a group with no peers".to_string(),
        ))
    }

    fn wait(self) -> Result<Vec<T>, CommError> {
        Err(CommError::Protocol(
            "receive posted in a group with no peers".to_string(),
        ))
    }
}

impl Communicator for SingleProcess {
    type SendRequest = ReadySend;
    type RecvRequest<T: Payload> = NeverRecv<T>;

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_to_all_counts(&self, send_counts: &[usize]) -> Result<Vec<usize>, CommError> {
        if send_counts.len() != 1 {
            return Err(CommError::Protocol(format!(
                "all-to-all payload has {} entries for a group of size 1",
                send_counts.len()
            )));
        }
        Ok(send_counts.to_vec())
    }

    fn all_reduce_or(&self, value: bool) -> Result<bool, CommError> {
        Ok(value)
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError> {
        Ok(value)
    }

    fn isend<T: Payload>(
        &self,
        _data: Vec<T>,
        dest: usize,
        _tag: MessageTag,
    ) -> Result<Self::SendRequest, CommError> {
        Err(CommError::InvalidRank { rank: dest, size: 1 })
    }

    fn irecv<T: Payload>(
        &self,
        src: usize,
        _tag: MessageTag,
        _len: usize,
    ) -> Result<Self::RecvRequest<T>, CommError> {
        Err(CommError::InvalidRank { rank: src, size: 1 })
    }
}

type MailKey = (usize, usize, MessageTag);

/// Rendezvous state for one collective round.
struct Round {
    slots: Vec<Option<Box<dyn Any + Send>>>,
    arrived: usize,
    departed: usize,
    ready: bool,
}

impl Round {
    fn new(size: usize) -> Self {
        Round {
            slots: (0..size).map(|_| None).collect(),
            arrived: 0,
            departed: 0,
            ready: false,
        }
    }
}

struct GroupState {
    mail: HashMap<MailKey, VecDeque<Box<dyn Any + Send>>>,
    round: Round,
}

struct Shared {
    size: usize,
    state: Mutex<GroupState>,
    // Signaled when mail is delivered.
    delivered: Condvar,
    // Signaled when a collective round fills up or resets.
    rendezvous: Condvar,
}

/// One rank of an in-process group.
///
/// All ranks of a group share their mailboxes; hand each clone produced by
/// [`LocalComm::group`] to its own thread. Cloning an individual rank is
/// cheap and yields another handle to the same rank.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl LocalComm {
    /// Creates a group of `size` ranks. Panics if `size` is zero.
    pub fn group(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "a process group must have at least one rank");
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(GroupState {
                mail: HashMap::new(),
                round: Round::new(size),
            }),
            delivered: Condvar::new(),
            rendezvous: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.shared.size {
            Err(CommError::InvalidRank {
                rank,
                size: self.shared.size,
            })
        } else {
            Ok(())
        }
    }

    /// Runs one collective round: deposit `payload`, wait for the group,
    /// combine every rank's contribution, and leave. The last rank to leave
    /// resets the round for the next collective.
    fn collective<P, R>(
        &self,
        payload: P,
        combine: impl FnOnce(&[&P]) -> Result<R, CommError>,
    ) -> Result<R, CommError>
    where
        P: Send + 'static,
    {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        // A previous round may still be draining; its slots are not ours to
        // overwrite until every rank has left it.
        while state.round.ready {
            shared.rendezvous.wait(&mut state);
        }
        if state.round.slots[self.rank].is_some() {
            return Err(CommError::Protocol(format!(
                "rank {} entered a collective twice in one round",
                self.rank
            )));
        }

        state.round.slots[self.rank] = Some(Box::new(payload));
        state.round.arrived += 1;
        if state.round.arrived == shared.size {
            state.round.ready = true;
            shared.rendezvous.notify_all();
        } else {
            while !state.round.ready {
                shared.rendezvous.wait(&mut state);
            }
        }

        let result = {
            let mut views = Vec::with_capacity(shared.size);
            let mut mismatch = None;
            for (peer, slot) in state.round.slots.iter().enumerate() {
                let boxed = slot.as_ref().ok_or_else(|| {
                    CommError::Protocol("collective slot emptied mid-round".to_string())
                })?;
                match boxed.downcast_ref::<P>() {
                    Some(payload) => views.push(payload),
                    None => {
                        mismatch = Some(peer);
                        break;
                    }
                }
            }
            match mismatch {
                Some(peer) => Err(CommError::Protocol(format!(
                    "rank {} contributed a different collective payload type",
                    peer
                ))),
                None => combine(&views),
            }
        };

        // Leave the round even on error so the rest of the group is not
        // deadlocked behind a poisoned rendezvous.
        state.round.departed += 1;
        if state.round.departed == shared.size {
            state.round = Round::new(shared.size);
            shared.rendezvous.notify_all();
        }

        result
    }
}

/// A posted receive on an in-process group.
pub struct LocalRecv<T> {
    shared: Arc<Shared>,
    key: MailKey,
    expected_len: usize,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T: Payload> LocalRecv<T> {
    fn take_from_queue(
        state: &mut GroupState,
        key: MailKey,
        expected_len: usize,
    ) -> Result<Option<Vec<T>>, CommError> {
        let queue = match state.mail.get_mut(&key) {
            Some(queue) if !queue.is_empty() => queue,
            _ => return Ok(None),
        };
        let boxed = queue.pop_front().unwrap();
        let data = boxed.downcast::<Vec<T>>().map_err(|_| {
            CommError::Protocol(format!(
                "message from rank {} under tag {:?} has an unexpected payload type",
                key.0, key.2
            ))
        })?;
        if data.len() != expected_len {
            return Err(CommError::LengthMismatch {
                expected: expected_len,
                actual: data.len(),
            });
        }
        Ok(Some(*data))
    }
}

impl<T: Payload> RecvHandle<T> for LocalRecv<T> {
    fn test(&mut self) -> Result<Option<Vec<T>>, CommError> {
        let mut state = self.shared.state.lock();
        Self::take_from_queue(&mut state, self.key, self.expected_len)
    }

    fn wait(self) -> Result<Vec<T>, CommError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(data) = Self::take_from_queue(&mut state, self.key, self.expected_len)? {
                return Ok(data);
            }
            self.shared.delivered.wait(&mut state);
        }
    }
}

impl Communicator for LocalComm {
    type SendRequest = ReadySend;
    type RecvRequest<T: Payload> = LocalRecv<T>;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all_counts(&self, send_counts: &[usize]) -> Result<Vec<usize>, CommError> {
        let size = self.shared.size;
        if send_counts.len() != size {
            return Err(CommError::Protocol(format!(
                "all-to-all payload has {} entries for a group of size {}",
                send_counts.len(),
                size
            )));
        }
        let me = self.rank;
        self.collective(send_counts.to_vec(), |rows| {
            let mut received = Vec::with_capacity(size);
            for (peer, row) in rows.iter().enumerate() {
                if row.len() != size {
                    return Err(CommError::Protocol(format!(
                        "rank {} contributed an all-to-all row of length {}",
                        peer,
                        row.len()
                    )));
                }
                received.push(row[me]);
            }
            Ok(received)
        })
    }

    fn all_reduce_or(&self, value: bool) -> Result<bool, CommError> {
        self.collective(value, |values| Ok(values.iter().any(|&&v| v)))
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64, CommError> {
        self.collective(value, |values| Ok(values.iter().map(|&&v| v).sum()))
    }

    fn isend<T: Payload>(
        &self,
        data: Vec<T>,
        dest: usize,
        tag: MessageTag,
    ) -> Result<Self::SendRequest, CommError> {
        self.check_rank(dest)?;
        let key = (self.rank, dest, tag);
        let mut state = self.shared.state.lock();
        state
            .mail
            .entry(key)
            .or_insert_with(VecDeque::new)
            .push_back(Box::new(data));
        self.shared.delivered.notify_all();
        // The mailbox owns the payload from here on, so the send is complete
        // as soon as it is posted.
        Ok(ReadySend(()))
    }

    fn irecv<T: Payload>(
        &self,
        src: usize,
        tag: MessageTag,
        len: usize,
    ) -> Result<Self::RecvRequest<T>, CommError> {
        self.check_rank(src)?;
        Ok(LocalRecv {
            shared: Arc::clone(&self.shared),
            key: (src, self.rank, tag),
            expected_len: len,
            _payload: std::marker::PhantomData,
        })
    }
}
