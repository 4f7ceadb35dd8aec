use foreman_core::{ForemanError, ForemanResult, WorkPackage, WpId};
use std::collections::{BTreeMap, HashMap};

/// Adjacency node: immediate dependencies and dependents of one package.
#[derive(Debug, Clone, Default)]
struct Node {
    deps: Vec<WpId>,
    dependents: Vec<WpId>,
}

/// The DAG of work-package prerequisite relationships.
///
/// Built from declared dependency sets; construction rejects unknown
/// references and cycles before anything is scheduled.
#[derive(Debug, Clone)]
pub struct DepGraph {
    nodes: BTreeMap<WpId, Node>,
}

impl DepGraph {
    /// Builds and validates the graph from a set of work packages.
    ///
    /// Fails with [`ForemanError::Config`] when a package depends on an id
    /// that is not declared, or when the dependencies contain a cycle. The
    /// cycle error names the offending path.
    pub fn build(packages: &[WorkPackage]) -> ForemanResult<Self> {
        let mut nodes: BTreeMap<WpId, Node> = packages
            .iter()
            .map(|wp| {
                (
                    wp.id.clone(),
                    Node {
                        deps: wp.depends_on.clone(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        if nodes.len() != packages.len() {
            return Err(ForemanError::Config(
                "duplicate work package ids in feature declaration".to_string(),
            ));
        }

        for wp in packages {
            for dep in &wp.depends_on {
                if !nodes.contains_key(dep) {
                    return Err(ForemanError::Config(format!(
                        "work package {} depends on unknown package {dep}",
                        wp.id
                    )));
                }
            }
        }

        // Second pass: populate dependents from the validated deps.
        for wp in packages {
            for dep in &wp.depends_on {
                if let Some(node) = nodes.get_mut(dep) {
                    node.dependents.push(wp.id.clone());
                }
            }
        }

        let graph = Self { nodes };
        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            return Err(ForemanError::Config(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }

        Ok(graph)
    }

    /// All declared package ids, in id order.
    pub fn packages(&self) -> impl Iterator<Item = &WpId> {
        self.nodes.keys()
    }

    /// Immediate dependencies of a package.
    pub fn dependencies_of(&self, id: &WpId) -> &[WpId] {
        self.nodes.get(id).map(|n| n.deps.as_slice()).unwrap_or(&[])
    }

    /// Immediate dependents of a package.
    pub fn dependents_of(&self, id: &WpId) -> &[WpId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Three-color DFS over the dependency edges. Returns the first cycle
    /// found as a path, or `None` for a valid DAG.
    fn find_cycle(&self) -> Option<Vec<WpId>> {
        // 1 = on the current path, 2 = fully explored.
        let mut marks: HashMap<&WpId, u8> = HashMap::new();
        let mut path: Vec<WpId> = Vec::new();

        for id in self.nodes.keys() {
            if let Some(cycle) = self.dfs(id, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        id: &'a WpId,
        marks: &mut HashMap<&'a WpId, u8>,
        path: &mut Vec<WpId>,
    ) -> Option<Vec<WpId>> {
        match marks.get(id) {
            Some(1) => {
                // Back edge: the cycle is the path segment from the first
                // occurrence of this id.
                let start = path.iter().position(|p| p == id).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(id.clone());
                return Some(cycle);
            }
            Some(2) => return None,
            _ => {}
        }

        marks.insert(id, 1);
        path.push(id.clone());

        if let Some(node) = self.nodes.get(id) {
            for dep in &node.deps {
                if let Some(cycle) = self.dfs(dep, marks, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        marks.insert(id, 2);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::WorkPackage;

    fn wp(id: &str, deps: &[&str]) -> WorkPackage {
        WorkPackage::new(id, id.to_uppercase())
            .with_dependencies(deps.iter().map(|d| WpId::new(*d)).collect())
    }

    #[test]
    fn test_build_valid_graph() {
        let graph = DepGraph::build(&[
            wp("core", &[]),
            wp("api", &["core"]),
            wp("ui", &["api", "core"]),
        ])
        .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependencies_of(&WpId::new("ui")).len(), 2);
        assert_eq!(graph.dependents_of(&WpId::new("core")).len(), 2);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = DepGraph::build(&[wp("api", &["ghost"])]);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown package ghost"), "got: {err}");
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let result = DepGraph::build(&[
            wp("a", &["b"]),
            wp("b", &["c"]),
            wp("c", &["a"]),
        ]);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("dependency cycle"), "got: {err}");
        assert!(err.contains("a"), "cycle path should name members: {err}");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = DepGraph::build(&[wp("solo", &["solo"])]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = DepGraph::build(&[wp("dup", &[]), wp("dup", &[])]);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("duplicate"), "got: {err}");
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let graph = DepGraph::build(&[
            wp("base", &[]),
            wp("left", &["base"]),
            wp("right", &["base"]),
            wp("top", &["left", "right"]),
        ]);
        assert!(graph.is_ok());
    }
}
