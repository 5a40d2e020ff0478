use olivine::assembly::BcPolicy;
use olivine::backend::native::NativeBackend;
use olivine::backend::{DistributedVector, LinearBackend};
use olivine::comm::{Communicator, SingleProcess};
use olivine::connectivity::{DofLayout, NodalField};
use olivine::gather::{gather_solution, RequestList};

use super::{number_equations, run_on_group};

#[test]
fn request_lists_grow_by_half() {
    let mut list = RequestList::with_initial_capacity(5);
    // 10% of 5 owned equations rounds down to zero; the floor is one slot.
    assert_eq!(list.capacity(), 1);

    let mut capacities = Vec::new();
    for i in 0..10 {
        list.push(i, 0, i);
        capacities.push(list.capacity());
    }
    assert_eq!(list.len(), 10);
    // 1 -> 2 -> 3 -> 4 -> 6 -> 9 -> 13
    assert_eq!(capacities, vec![1, 2, 3, 4, 6, 6, 9, 9, 9, 13]);
}

#[test]
fn request_list_initial_capacity_scales_with_ownership() {
    assert_eq!(RequestList::with_initial_capacity(0).capacity(), 1);
    assert_eq!(RequestList::with_initial_capacity(40).capacity(), 4);
}

#[test]
fn single_rank_gather_copies_owned_values() {
    let mut field = NodalField::<f64>::uniform(3, 1);
    field.set_boundary_condition(0, 0, 7.0);
    let space = number_equations(&field, BcPolicy::Eliminate, 0, 1);

    let backend = NativeBackend::new(SingleProcess);
    let mut solution = backend.create_vector(space.ownership()).unwrap();
    solution.insert(0, 1.5).unwrap();
    solution.insert(1, 2.5).unwrap();

    gather_solution(&solution, &mut field, &space, &SingleProcess).unwrap();
    // The constrained DOF keeps its prescribed value.
    assert_eq!(field.value(0, 0), 7.0);
    assert_eq!(field.value(1, 0), 1.5);
    assert_eq!(field.value(2, 0), 2.5);
}

#[test]
fn two_rank_gather_fetches_remote_values() {
    run_on_group(2, |comm| {
        let me = comm.rank();
        // Ten equations on ten replicated nodes, owned five and five.
        let mut field = NodalField::<f64>::uniform(10, 1);
        let space = number_equations(&field, BcPolicy::Eliminate, me, 2);
        assert_eq!(space.ownership().num_owned(), 5);

        let backend = NativeBackend::new(comm.clone());
        let mut solution = backend.create_vector(space.ownership()).unwrap();
        for equation in space.ownership().owned_range() {
            solution.insert(equation, 10.0 * equation as f64).unwrap();
        }

        gather_solution(&solution, &mut field, &space, &comm).unwrap();
        for node in 0..10 {
            assert_eq!(field.value(node, 0), 10.0 * node as f64);
        }
    });
}

#[test]
fn repeated_gathers_are_idempotent() {
    run_on_group(2, |comm| {
        let me = comm.rank();
        let mut field = NodalField::<f64>::uniform(10, 1);
        let space = number_equations(&field, BcPolicy::Eliminate, me, 2);

        let backend = NativeBackend::new(comm.clone());
        let mut solution = backend.create_vector(space.ownership()).unwrap();
        for equation in space.ownership().owned_range() {
            solution.insert(equation, equation as f64 - 3.0).unwrap();
        }

        gather_solution(&solution, &mut field, &space, &comm).unwrap();
        let first: Vec<f64> = (0..10).map(|node| field.value(node, 0)).collect();
        gather_solution(&solution, &mut field, &space, &comm).unwrap();
        let second: Vec<f64> = (0..10).map(|node| field.value(node, 0)).collect();
        assert_eq!(first, second);
    });
}

#[test]
fn lopsided_gather_services_one_direction_only() {
    run_on_group(2, |comm| {
        let me = comm.rank();
        // Rank 1 stores only its own nodes, so requests flow in one
        // direction: rank 0 fetches the tail equations from rank 1.
        let num_nodes = if me == 0 { 6 } else { 3 };
        let mut field = NodalField::<f64>::uniform(num_nodes, 1);
        let equations = (0..num_nodes)
            .map(|node| {
                // Rank 1's nodes sit at the tail of the global numbering.
                let equation = if me == 0 { node } else { 3 + node };
                vec![Some(equation)]
            })
            .collect();
        let ownership = olivine::numbering::EquationOwnership::new(me, vec![0, 3], 6);
        let space = olivine::numbering::EquationSpace::new(equations, ownership);

        let backend = NativeBackend::new(comm.clone());
        let mut solution = backend.create_vector(space.ownership()).unwrap();
        for equation in space.ownership().owned_range() {
            solution.insert(equation, equation as f64 + 0.25).unwrap();
        }

        gather_solution(&solution, &mut field, &space, &comm).unwrap();
        for node in 0..num_nodes {
            let equation = if me == 0 { node } else { 3 + node };
            assert_eq!(field.value(node, 0), equation as f64 + 0.25);
        }
    });
}
