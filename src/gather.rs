//! Scatter of a solved vector back onto nodal storage.
//!
//! After a solve, every rank holds the owned slice of the solution vector,
//! but its local nodes may carry equations owned elsewhere. [`gather_solution`]
//! copies the owned entries directly and runs a two-phase exchange for the
//! rest: each rank sends the equation numbers it is missing to their owners,
//! services the requests it receives in turn, and polls its posted receives
//! until every missing value has arrived.

use eyre::bail;
use olivine_comm::{Communicator, MessageTag, RecvHandle, SendHandle};

use crate::backend::DistributedVector;
use crate::connectivity::DofLayout;
use crate::numbering::EquationSpace;
use crate::Real;

const VALUE_TAG: MessageTag = MessageTag(1);
const REQUEST_TAG: MessageTag = MessageTag(2);

/// The equations one rank needs from one owner, with the nodal slot each
/// value lands in.
#[derive(Debug, Clone, Default)]
pub struct RequestList {
    slots: Vec<(usize, usize)>,
    equations: Vec<u64>,
    capacity: usize,
}

impl RequestList {
    /// An empty list sized for a typical share of `num_owned` equations.
    pub fn with_initial_capacity(num_owned: usize) -> Self {
        let capacity = (num_owned / 10).max(1);
        let mut list = RequestList::default();
        list.reserve_to(capacity);
        list
    }

    fn reserve_to(&mut self, capacity: usize) {
        self.slots.reserve_exact(capacity - self.slots.len());
        self.equations.reserve_exact(capacity - self.equations.len());
        self.capacity = capacity;
    }

    pub fn push(&mut self, node: usize, dof: usize, equation: usize) {
        if self.slots.len() == self.capacity {
            let grown = self.capacity * 3 / 2;
            let grown = if grown == self.capacity {
                self.capacity + 1
            } else {
                grown
            };
            self.reserve_to(grown);
        }
        self.slots.push((node, dof));
        self.equations.push(equation as u64);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Writes the solved values of every local DOF back into `layout`.
///
/// Owned entries are copied straight out of `solution`; entries owned by
/// other ranks are fetched from them. Collective: every rank of the group
/// must call this for the same field, even ranks missing nothing.
pub fn gather_solution<T, V, C>(
    solution: &V,
    layout: &mut dyn DofLayout<T>,
    space: &EquationSpace,
    comm: &C,
) -> eyre::Result<()>
where
    T: Real + Send + 'static,
    V: DistributedVector<T>,
    C: Communicator,
{
    let ownership = space.ownership();
    let owned_values = solution.owned_values();
    let mut requests: Vec<RequestList> = (0..comm.size())
        .map(|_| RequestList::with_initial_capacity(ownership.num_owned()))
        .collect();

    for node in 0..space.num_nodes() {
        for dof in 0..space.dof_count(node) {
            let equation = match space.equation(node, dof) {
                Some(eq) => eq,
                None => continue,
            };
            match ownership.local_offset(equation) {
                Some(offset) => layout.set_value(node, dof, owned_values[offset]),
                None => requests[ownership.owning_rank(equation)].push(node, dof, equation),
            }
        }
    }

    if comm.size() == 1 {
        return Ok(());
    }

    let send_counts: Vec<usize> = requests.iter().map(RequestList::len).collect();
    let recv_counts = comm.all_to_all_counts(&send_counts)?;
    let total_requested: usize = send_counts.iter().sum();
    let total_serviced: usize = recv_counts.iter().sum();
    if total_requested == 0 && total_serviced == 0 {
        return Ok(());
    }

    // Phase one: everyone announces which equations they are missing, and
    // posts receives for the values that will come back.
    let mut sends = Vec::new();
    for (peer, list) in requests.iter().enumerate() {
        if !list.is_empty() {
            sends.push(comm.isend(list.equations.clone(), peer, REQUEST_TAG)?);
        }
    }
    let mut pending: Vec<(usize, C::RecvRequest<T>)> = Vec::new();
    for (peer, list) in requests.iter().enumerate() {
        if !list.is_empty() {
            pending.push((peer, comm.irecv(peer, VALUE_TAG, list.len())?));
        }
    }

    // Phase two: service inbound requests from the owned slice.
    for (peer, &count) in recv_counts.iter().enumerate() {
        if peer == comm.rank() || count == 0 {
            continue;
        }
        let wanted: Vec<u64> = comm.recv(peer, REQUEST_TAG, count)?;
        let mut values = Vec::with_capacity(count);
        for equation in wanted {
            match ownership.local_offset(equation as usize) {
                Some(offset) => values.push(owned_values[offset]),
                None => bail!(
                    "rank {} requested equation {}, which this rank does not own",
                    peer,
                    equation
                ),
            }
        }
        sends.push(comm.isend(values, peer, VALUE_TAG)?);
    }

    // Poll the posted receives until every missing value has landed.
    let mut pending: Vec<Option<(usize, C::RecvRequest<T>)>> =
        pending.into_iter().map(Some).collect();
    let mut outstanding = pending.len();
    while outstanding > 0 {
        for slot in pending.iter_mut() {
            let (peer, request) = match slot.as_mut() {
                Some(entry) => entry,
                None => continue,
            };
            if let Some(values) = request.test()? {
                let list = &requests[*peer];
                for (&(node, dof), value) in list.slots.iter().zip(values) {
                    layout.set_value(node, dof, value);
                }
                *slot = None;
                outstanding -= 1;
            }
        }
        if outstanding > 0 {
            std::thread::yield_now();
        }
    }

    for send in sends {
        send.wait()?;
    }
    Ok(())
}
