use crate::{
    config::Config,
    types::{HashMap, IndexMap, IndexSet, UnitId},
    unit::Unit,
};
use derive_more::Debug;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when a set of units cannot be leveled.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum PlanError {
    /// The dependency graph contains cycle(s).
    ///
    /// `unresolved` lists, in insertion order, every unit that could not be
    /// placed: the units on a cycle and everything depending on them.
    #[error("circular dependency: {} unit(s) could not be leveled", .unresolved.len())]
    Cycle {
        /// Units left without a level.
        unresolved: Vec<UnitId>,
    },
    /// A unit depends on a unit that is not part of the plan.
    #[error("unit {unit} depends on unit {dependency}, which is not part of the plan")]
    UnknownDependency {
        /// The dependent unit.
        unit: UnitId,
        /// The missing dependency.
        dependency: UnitId,
    },
    /// The same unit was passed twice.
    #[error("unit {0} appears more than once")]
    DuplicateUnit(UnitId),
}

/// Units partitioned into topological levels.
///
/// Every unit of level `n` depends only on units of levels `< n`, so the
/// units of one level may all run concurrently once earlier levels are
/// done. A plan is immutable; build a new one after adding units.
#[must_use]
#[derive(Debug)]
pub struct ExecutionPlan<C: Config> {
    #[debug(skip)]
    units: IndexMap<UnitId, Arc<Unit<C>>>,
    graph: IndexMap<UnitId, IndexSet<UnitId>>,
    levels: Vec<Vec<UnitId>>,
    #[debug(skip)]
    level_of: HashMap<UnitId, usize>,
}

impl<C: Config> ExecutionPlan<C> {
    /// Level `units`.
    ///
    /// Within a level, units keep the relative order they have in `units`,
    /// so the same input always yields the same plan.
    ///
    /// # Errors
    /// [`PlanError::Cycle`] if the graph is not a DAG,
    /// [`PlanError::UnknownDependency`] if a dependency is missing from
    /// `units`, [`PlanError::DuplicateUnit`] if a unit is listed twice.
    pub fn new(units: &[Arc<Unit<C>>]) -> Result<Self, PlanError> {
        // Phase 1: index units by id, preserving insertion order. The index
        // of a unit in this map is used as its dense position below.
        let mut index = IndexMap::with_capacity_and_hasher(units.len(), FxBuildHasher);
        for unit in units {
            if index.insert(unit.id(), unit.clone()).is_some() {
                return Err(PlanError::DuplicateUnit(unit.id()));
            }
        }

        // Phase 2: dependency graph (deduplicated) and its reverse edges.
        let mut graph = IndexMap::with_capacity_and_hasher(index.len(), FxBuildHasher);
        let mut dependents = vec![Vec::new(); index.len()];
        for (child_pos, (&id, unit)) in index.iter().enumerate() {
            let dependencies: IndexSet<UnitId> = unit.dependency_ids().into_iter().collect();
            for dependency in &dependencies {
                let Some(parent_pos) = index.get_index_of(dependency) else {
                    return Err(PlanError::UnknownDependency {
                        unit: id,
                        dependency: *dependency,
                    });
                };
                dependents[parent_pos].push(child_pos);
            }
            graph.insert(id, dependencies);
        }

        // Phase 3: peel off generations of units whose remaining in-degree is
        // zero. Each edge is decremented exactly once since dependency sets
        // are deduplicated.
        let mut in_degree: Vec<usize> = graph.values().map(IndexSet::len).collect();
        let mut current: Vec<usize> = (0..in_degree.len())
            .filter(|&pos| in_degree[pos] == 0)
            .collect();
        let mut levels = Vec::new();
        let mut level_of = HashMap::with_capacity_and_hasher(index.len(), FxBuildHasher);
        while !current.is_empty() {
            let mut next = Vec::new();
            for &pos in &current {
                for &child in &dependents[pos] {
                    in_degree[child] -= 1;
                    if in_degree[child] == 0 {
                        next.push(child);
                    }
                }
            }
            // Children are discovered in parent order; restore insertion order.
            next.sort_unstable();
            let level_idx = levels.len();
            let level: Vec<UnitId> = current
                .iter()
                .filter_map(|&pos| index.get_index(pos).map(|(id, _)| *id))
                .collect();
            level_of.extend(level.iter().map(|&id| (id, level_idx)));
            levels.push(level);
            current = next;
        }

        // Phase 4: a cycle can coexist with resolvable units, so compare the
        // placed count against the total rather than relying on a stall.
        if level_of.len() != index.len() {
            let unresolved = index
                .keys()
                .zip(&in_degree)
                .filter(|&(_, &degree)| degree > 0)
                .map(|(&id, _)| id)
                .collect();
            return Err(PlanError::Cycle { unresolved });
        }

        Ok(Self {
            units: index,
            graph,
            levels,
            level_of,
        })
    }

    /// Number of levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Units of level `level_idx`, empty when out of range.
    #[must_use]
    pub fn units_at_level(&self, level_idx: usize) -> Vec<Arc<Unit<C>>> {
        self.levels.get(level_idx).map_or_else(Vec::new, |level| {
            level
                .iter()
                .filter_map(|id| self.units.get(id).cloned())
                .collect()
        })
    }

    /// Size of the largest level, 0 for an empty plan.
    #[must_use]
    pub fn maximum_parallelism(&self) -> usize {
        self.levels.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Unit ids of every level, in execution order.
    #[must_use]
    pub fn levels(&self) -> &[Vec<UnitId>] {
        &self.levels
    }

    /// Level the unit was placed in.
    #[must_use]
    pub fn level_of(&self, id: UnitId) -> Option<usize> {
        self.level_of.get(&id).copied()
    }

    /// Deduplicated dependency ids of a unit.
    #[must_use]
    pub fn dependencies_of(&self, id: UnitId) -> Option<&IndexSet<UnitId>> {
        self.graph.get(&id)
    }

    /// Look a unit up by id.
    #[must_use]
    pub fn unit(&self, id: UnitId) -> Option<&Arc<Unit<C>>> {
        self.units.get(&id)
    }

    /// Number of units in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the plan has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[derive(core::fmt::Debug)]
    struct Strings;

    impl Config for Strings {
        type Context = ();
        type Output = &'static str;
    }

    fn unit(name: &'static str, deps: &[&Arc<Unit<Strings>>]) -> Arc<Unit<Strings>> {
        Unit::<Strings>::builder(move |_: &()| Ok(name))
            .name(name)
            .dependencies(deps.iter().copied())
            .build()
    }

    fn ids(units: &[&Arc<Unit<Strings>>]) -> Vec<UnitId> {
        units.iter().map(|u| u.id()).collect()
    }

    #[test]
    fn diamond() {
        //   A     B
        //    \   /
        //      C
        //      |
        //      D
        let a = unit("a", &[]);
        let b = unit("b", &[]);
        let c = unit("c", &[&a, &b]);
        let d = unit("d", &[&c]);

        // Shuffle insertion order to exercise the leveling.
        let plan = ExecutionPlan::new(&[d.clone(), c.clone(), b.clone(), a.clone()]).unwrap();
        assert_eq!(plan.level_count(), 3);
        assert_eq!(plan.levels()[0], ids(&[&b, &a]));
        assert_eq!(plan.levels()[1], ids(&[&c]));
        assert_eq!(plan.levels()[2], ids(&[&d]));
        assert_eq!(plan.maximum_parallelism(), 2);
        assert_eq!(plan.level_of(d.id()), Some(2));
        assert_eq!(plan.len(), 4);

        let deps: Vec<_> = plan
            .dependencies_of(c.id())
            .into_iter()
            .flatten()
            .copied()
            .collect();
        assert_eq!(deps, ids(&[&a, &b]));
        assert!(plan.dependencies_of(a.id()).is_some_and(|deps| deps.is_empty()));
    }

    #[test]
    fn simultaneous_units_keep_insertion_order() {
        let root = unit("root", &[]);
        let x = unit("x", &[&root]);
        let y = unit("y", &[&root]);
        let z = unit("z", &[&root]);
        let w = unit("w", &[&root]);
        let input = [root.clone(), z.clone(), x.clone(), w.clone(), y.clone()];

        let first = ExecutionPlan::new(&input).unwrap();
        let second = ExecutionPlan::new(&input).unwrap();
        assert_eq!(first.levels()[1], ids(&[&z, &x, &w, &y]));
        assert_eq!(first.levels(), second.levels());

        let names: Vec<_> = first
            .units_at_level(1)
            .iter()
            .map(|u| u.name().to_owned())
            .collect();
        assert_eq!(names, ["z", "x", "w", "y"]);
    }

    #[test]
    fn duplicate_dependencies_are_collapsed() {
        let a = unit("a", &[]);
        let b = unit("b", &[&a, &a]);
        assert!(b.depends_on(&a));
        let plan = ExecutionPlan::new(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(plan.dependencies_of(b.id()).map(IndexSet::len), Some(1));
        assert_eq!(plan.level_of(b.id()), Some(1));
    }

    #[test]
    fn out_of_range_level_is_empty() {
        let a = unit("a", &[]);
        let plan = ExecutionPlan::new(&[a]).unwrap();
        assert!(plan.units_at_level(1).is_empty());
        assert!(plan.units_at_level(usize::MAX).is_empty());
    }

    #[test]
    fn empty_plan() {
        let plan = ExecutionPlan::<Strings>::new(&[]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.level_count(), 0);
        assert_eq!(plan.maximum_parallelism(), 0);
    }

    #[test]
    fn cycle_next_to_resolvable_units() {
        let a = unit("a", &[]);
        let b = unit("b", &[&a]);
        let c = unit("c", &[&b]);
        let d = unit("d", &[&c]);
        let e = unit("e", &[&a]);
        // Close the loop b -> c -> b; d hangs off the cycle.
        assert!(b.depends_on(&c));

        let err = ExecutionPlan::new(&[a, b.clone(), c.clone(), d.clone(), e]).unwrap_err();
        assert_eq!(
            err,
            PlanError::Cycle {
                unresolved: ids(&[&b, &c, &d])
            }
        );
        assert!(err.to_string().starts_with("circular dependency"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let a = unit("a", &[]);
        assert!(a.depends_on(&a));
        let err = ExecutionPlan::new(&[a.clone()]).unwrap_err();
        assert_eq!(err, PlanError::Cycle { unresolved: vec![a.id()] });
    }

    #[test]
    fn unknown_dependency() {
        let outsider = unit("outsider", &[]);
        let a = unit("a", &[&outsider]);
        let err = ExecutionPlan::new(&[a.clone()]).unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownDependency {
                unit: a.id(),
                dependency: outsider.id()
            }
        );
    }

    #[test]
    fn duplicate_unit() {
        let a = unit("a", &[]);
        let err = ExecutionPlan::new(&[a.clone(), a.clone()]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateUnit(a.id()));
    }
}
