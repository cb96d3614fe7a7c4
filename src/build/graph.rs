//! Discovery of the unit set behind a requested path, cycle detection and batch partitioning.

use petgraph::{
    algo::{kosaraju_scc, toposort},
    graph::{DiGraph, NodeIndex},
    Direction,
};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::{
    build::unit::CompilationUnit,
    cache::CompilationCache,
    config::BuildConfig,
    deps::DependencyExtractor,
    error::QuireError,
    markup::tree::ParseLocation,
    paths::LogicalPath,
    vfs::VirtualFileSystem,
};

/// Units compiled together in one toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildBatch {
    /// In discovery order.
    pub units: Vec<CompilationUnit>,
    pub language: String,
    /// Application entry or directory aggregate; never shares a batch.
    pub standalone: bool,
}

impl BuildBatch {
    pub fn paths(&self) -> Vec<LogicalPath> {
        self.units.iter().map(|u| u.path.clone()).collect()
    }

    pub fn contains(&self, path: &LogicalPath) -> bool {
        self.units.iter().any(|u| &u.path == path)
    }
}

/// Uncached units needed to build one path. Edges run from a dependency to its dependent.
#[derive(Debug)]
pub struct BuildGraph {
    graph: DiGraph<CompilationUnit, ()>,
    index: HashMap<LogicalPath, NodeIndex>,
    requested: LogicalPath,
    application_entry: LogicalPath,
}

impl BuildGraph {
    /// Walk dependencies breadth-first from `requested`, stopping at cached units.
    pub fn discover(
        vfs: &dyn VirtualFileSystem,
        config: &BuildConfig,
        deps: &DependencyExtractor,
        cache: &CompilationCache,
        requested: &LogicalPath,
    ) -> Result<BuildGraph, QuireError> {
        let application_entry = config.application_entry_path();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut queue = VecDeque::from([requested.clone()]);
        let mut queued = vec![requested.clone()];

        while let Some(path) = queue.pop_front() {
            let scan = deps.scan(vfs, &path, config)?;
            for dep in scan.dependencies.iter() {
                if dep == &application_entry {
                    return Err(QuireError::parse(
                        ParseLocation::start_of(&path),
                        format!("The application entry '{dep}' cannot be referenced by '{path}'."),
                    ));
                }
                if !vfs.exists(dep) {
                    return Err(QuireError::not_found(dep));
                }
                if cache.contains(&CompilationCache::key_for(dep)) || queued.contains(dep) {
                    continue;
                }
                queued.push(dep.clone());
                queue.push_back(dep.clone());
            }
            let unit = CompilationUnit {
                path: path.clone(),
                kind: scan.kind,
                language: scan.language.clone(),
                dependencies: scan.dependencies.clone(),
                members: scan.members.clone(),
                discovery_index: index.len(),
            };
            index.insert(path, graph.add_node(unit));
        }

        for node in graph.node_indices().collect::<Vec<_>>() {
            let dependencies = graph[node].dependencies.clone();
            for dep in dependencies.iter() {
                if let Some(&from) = index.get(dep) {
                    graph.add_edge(from, node, ());
                }
            }
        }
        tracing::debug!(
            "[BuildGraph] {} needs {} uncached units",
            requested,
            graph.node_count()
        );

        let build_graph = BuildGraph {
            graph,
            index,
            requested: requested.clone(),
            application_entry,
        };
        build_graph.check_cycles()?;
        Ok(build_graph)
    }

    fn check_cycles(&self) -> Result<(), QuireError> {
        for scc in kosaraju_scc(&self.graph).iter() {
            let is_cycle = scc.len() > 1
                || scc
                    .first()
                    .map(|&n| self.graph.contains_edge(n, n))
                    .unwrap_or(false);
            if is_cycle {
                let mut members: Vec<&CompilationUnit> =
                    scc.iter().map(|&n| &self.graph[n]).collect();
                members.sort_by_key(|u| u.discovery_index);
                let mut cycle: Vec<LogicalPath> = members.iter().map(|u| u.path.clone()).collect();
                cycle.push(members[0].path.clone());
                tracing::warn!("[BuildGraph] dependency cycle: {:?}", cycle);
                return Err(QuireError::DependencyCycle(cycle));
            }
        }
        Ok(())
    }

    pub fn requested(&self) -> &LogicalPath {
        &self.requested
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn unit(&self, path: &LogicalPath) -> Option<&CompilationUnit> {
        self.index.get(path).map(|&n| &self.graph[n])
    }

    /// Units in discovery order.
    pub fn units(&self) -> Vec<&CompilationUnit> {
        let mut units: Vec<&CompilationUnit> = self.graph.node_weights().collect();
        units.sort_by_key(|u| u.discovery_index);
        units
    }

    /// Uncached units that directly depend on `path`.
    pub fn dependents(&self, path: &LogicalPath) -> Vec<LogicalPath> {
        match self.index.get(path) {
            Some(&n) => self
                .graph
                .neighbors_directed(n, Direction::Outgoing)
                .map(|d| self.graph[d].path.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Partition into ordered batches.
    ///
    /// A unit's level is one more than the highest level among its uncached dependencies, so
    /// units sharing a level never depend on each other. Units share a batch when they share
    /// level, directory and language. With `single` every unit gets its own batch. Batches are
    /// ordered by level, then directory, language and discovery order, with the application
    /// entry last.
    pub fn partition(&self, single: bool) -> Result<Vec<BuildBatch>, QuireError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            QuireError::DependencyCycle(vec![self.graph[cycle.node_id()].path.clone()])
        })?;
        let mut levels: HashMap<NodeIndex, usize> = HashMap::new();
        for node in order.iter() {
            let level = self
                .graph
                .neighbors_directed(*node, Direction::Incoming)
                .filter_map(|dep| levels.get(&dep))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);
            levels.insert(*node, level);
        }

        // (is application entry, level, directory, language, singleton discovery index)
        type Key = (bool, usize, LogicalPath, String, Option<usize>);
        let mut groups: BTreeMap<Key, Vec<CompilationUnit>> = BTreeMap::new();
        for node in order.iter() {
            let unit = &self.graph[*node];
            let standalone = single || unit.kind.is_standalone();
            let key = (
                unit.path == self.application_entry,
                levels.get(node).copied().unwrap_or(0),
                unit.directory(),
                unit.language.clone(),
                standalone.then_some(unit.discovery_index),
            );
            groups.entry(key).or_default().push(unit.clone());
        }

        let batches: Vec<BuildBatch> = groups
            .into_iter()
            .map(|((_, _, _, language, singleton), mut units)| {
                units.sort_by_key(|u| u.discovery_index);
                let standalone =
                    singleton.is_some() && units.iter().all(|u| u.kind.is_standalone());
                BuildBatch {
                    units,
                    language,
                    standalone,
                }
            })
            .collect();
        tracing::debug!(
            "[BuildGraph] {} units in {} batches",
            self.len(),
            batches.len()
        );
        Ok(batches)
    }
}
