//! Property-based tests for leveling and failure propagation.
//!
//! Random DAGs are generated by letting unit `i` depend only on units with a
//! smaller index, which guarantees acyclicity; cycles are then injected
//! explicitly through `Unit::depends_on`.

#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use proptest::{prelude::*, sample::Index};
use qpart::{
    config::Config,
    partitioner::Partitioner,
    plan::{ExecutionPlan, PlanError},
    types::{HashSet, UnitId},
    unit::{Unit, UnitBuilder},
};
use std::sync::Arc;

#[derive(Debug)]
struct Positions;

impl Config for Positions {
    type Context = ();
    type Output = usize;
}

/// Dependency picks per unit; unit `i` resolves its picks modulo `i`.
fn dag_shape() -> impl Strategy<Value = Vec<Vec<Index>>> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 0..4), 1..24)
}

fn dependencies_of(shape: &[Vec<Index>], pos: usize) -> Vec<usize> {
    if pos == 0 {
        return Vec::new();
    }
    shape[pos].iter().map(|idx| idx.index(pos)).collect()
}

/// Build units for `shape`, handing each builder to `add`.
fn build_with(
    shape: &[Vec<Index>],
    failing: &HashSet<usize>,
    mut add: impl FnMut(UnitBuilder<Positions>) -> Arc<Unit<Positions>>,
) -> Vec<Arc<Unit<Positions>>> {
    let mut units: Vec<Arc<Unit<Positions>>> = Vec::with_capacity(shape.len());
    for pos in 0..shape.len() {
        let fails = failing.contains(&pos);
        let deps: Vec<_> = dependencies_of(shape, pos)
            .into_iter()
            .map(|dep| units[dep].clone())
            .collect();
        let builder = Unit::<Positions>::builder(move |_: &()| {
            if fails { Err(format!("unit {pos} failed").into()) } else { Ok(pos) }
        })
        .dependencies(&deps);
        units.push(add(builder));
    }
    units
}

fn build_units(shape: &[Vec<Index>]) -> Vec<Arc<Unit<Positions>>> {
    build_with(shape, &HashSet::default(), UnitBuilder::build)
}

fn ids(units: &[Arc<Unit<Positions>>]) -> Vec<UnitId> {
    units.iter().map(|unit| unit.id()).collect()
}

proptest! {
    /// Property: levels partition the units exactly and every unit sits
    /// strictly after all of its dependencies.
    #[test]
    fn prop_levels_partition_units(shape in dag_shape(), reverse in any::<bool>()) {
        let units = build_units(&shape);
        let mut input = units.clone();
        if reverse {
            input.reverse();
        }
        let plan = ExecutionPlan::new(&input).unwrap();

        let placed: Vec<UnitId> = plan.levels().iter().flatten().copied().collect();
        let unique: HashSet<UnitId> = placed.iter().copied().collect();
        prop_assert_eq!(placed.len(), units.len());
        prop_assert_eq!(unique, ids(&units).into_iter().collect::<HashSet<_>>());

        for (pos, unit) in units.iter().enumerate() {
            let level = plan.level_of(unit.id()).unwrap();
            let deps = dependencies_of(&shape, pos);
            for &dep in &deps {
                prop_assert!(plan.level_of(units[dep].id()).unwrap() < level);
            }
            // Generations are tight: a unit past level 0 has a dependency
            // exactly one level earlier.
            if level > 0 {
                prop_assert!(deps.iter().any(|&dep| plan.level_of(units[dep].id()) == Some(level - 1)));
            }
        }
        prop_assert_eq!(
            plan.maximum_parallelism(),
            plan.levels().iter().map(Vec::len).max().unwrap_or(0)
        );
    }

    /// Property: closing any path into a loop makes leveling fail.
    #[test]
    fn prop_back_edge_is_a_cycle(shape in dag_shape(), pick in any::<Index>()) {
        let units = build_units(&shape);
        let last = units.len() - 1;
        let first = pick.index(units.len());
        // `last` reaches `first` and `first` reaches `last`.
        prop_assert!(units[last].depends_on(&units[first]));
        prop_assert!(units[first].depends_on(&units[last]));

        let err = ExecutionPlan::new(&units).unwrap_err();
        let (first_id, last_id) = (units[first].id(), units[last].id());
        let closes_cycle = matches!(
            &err,
            PlanError::Cycle { unresolved }
                if unresolved.contains(&first_id) && unresolved.contains(&last_id)
        );
        prop_assert!(closes_cycle, "unexpected error: {err}");
    }

    /// Property: a unit yields a value iff neither it nor any ancestor
    /// failed, and only failing units land in the failed set.
    #[test]
    fn prop_failures_skip_descendants(
        shape in dag_shape(),
        failing in prop::collection::hash_set(0usize..24, 0..4),
        bound in 1usize..4,
    ) {
        let failing: HashSet<usize> = failing.into_iter().filter(|&pos| pos < shape.len()).collect();
        let mut partitioner = Partitioner::<Positions>::new();
        let units = build_with(&shape, &failing, |builder| partitioner.add(builder));

        // Oracle: poisoned if failing or any dependency is poisoned.
        let mut poisoned = vec![false; units.len()];
        let mut reached_failure = vec![false; units.len()];
        for pos in 0..units.len() {
            let upstream = dependencies_of(&shape, pos).into_iter().any(|dep| poisoned[dep]);
            reached_failure[pos] = failing.contains(&pos) && !upstream;
            poisoned[pos] = upstream || failing.contains(&pos);
        }

        let values = partitioner
            .execute((), std::num::NonZeroUsize::new(bound))
            .unwrap();
        let failed = partitioner.failed();
        let completed = partitioner.completed();
        for (pos, unit) in units.iter().enumerate() {
            prop_assert_eq!(values.get(&unit.id()).copied(), (!poisoned[pos]).then_some(pos));
            prop_assert_eq!(completed.contains(&unit.id()), !poisoned[pos]);
            prop_assert_eq!(failed.contains(&unit.id()), reached_failure[pos]);
        }
    }
}
