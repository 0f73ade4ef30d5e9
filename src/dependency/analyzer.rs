use std::collections::HashSet;

use super::Graph;
use crate::error::{Error, Result};
use crate::schema::ContainerDescriptor;

/// Validates the restrictions the application schema must satisfy and
/// derives the reverse dependency edges.
///
/// The master runs the full [`Analyzer::analyze`] pass before launching
/// anything; a schema with a dependency cycle or a duplicate service name
/// is refused outright.
#[derive(Debug, Default)]
pub struct Analyzer;

impl Analyzer {
    pub fn new() -> Self {
        Self
    }

    /// True when the `requires` graph contains a cycle.
    pub fn detect_circular_dependencies(&self, containers: &[ContainerDescriptor]) -> bool {
        let mut graph = Graph::new();
        for container in containers {
            graph.add_node(&container.service_name);
            for dep in &container.requires {
                graph.add_edge(&container.service_name, dep);
            }
        }
        graph.has_cycle()
    }

    /// True when two containers share a service name.
    pub fn detect_duplicate_names(&self, containers: &[ContainerDescriptor]) -> bool {
        let mut seen = HashSet::new();
        containers
            .iter()
            .any(|c| !seen.insert(c.service_name.as_str()))
    }

    /// True when a container requires a service no container offers.
    pub fn detect_unknown_dependencies(&self, containers: &[ContainerDescriptor]) -> bool {
        let known: HashSet<&str> = containers.iter().map(|c| c.service_name.as_str()).collect();
        containers
            .iter()
            .any(|c| c.requires.iter().any(|dep| !known.contains(dep.as_str())))
    }

    /// Fills every descriptor's `is_required_from` set with the exact reverse
    /// of the `requires` edges.
    pub fn populate_required_from(&self, containers: &mut [ContainerDescriptor]) {
        let names: Vec<String> = containers.iter().map(|c| c.service_name.clone()).collect();
        for i in 0..containers.len() {
            let service = names[i].clone();
            let dependents: Vec<String> = containers
                .iter()
                .filter(|other| other.requires.contains(&service))
                .map(|other| other.service_name.clone())
                .collect();
            let target = &mut containers[i].is_required_from;
            target.clear();
            target.extend(dependents);
        }
    }

    /// Full validation pass: duplicates, unknown dependencies, cycles; on
    /// success the reverse edges are populated in place.
    pub fn analyze(&self, containers: &mut [ContainerDescriptor]) -> Result<()> {
        if self.detect_duplicate_names(containers) {
            return Err(Error::InvalidSchema(
                "duplicate service names declared".to_string(),
            ));
        }
        if self.detect_unknown_dependencies(containers) {
            return Err(Error::InvalidSchema(
                "a container requires a service no container offers".to_string(),
            ));
        }
        if self.detect_circular_dependencies(containers) {
            return Err(Error::InvalidSchema(
                "circular dependency between containers".to_string(),
            ));
        }
        self.populate_required_from(containers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContainerType, ProcessGroup, Resource};

    fn container(name: &str, requires: &[&str]) -> ContainerDescriptor {
        ContainerDescriptor {
            service_name: name.to_string(),
            container_type: ContainerType::Business,
            requires: requires.iter().map(|r| r.to_string()).collect(),
            is_required_from: Default::default(),
            start: ProcessGroup {
                pre_main: vec![],
                main: Some(Resource::new(name, "/bin/true")),
                post_main: vec![],
            },
            stop: ProcessGroup::default(),
            tasks: None,
            env: Default::default(),
        }
    }

    #[test]
    fn detects_cycle() {
        let containers = vec![container("a", &["b"]), container("b", &["a"])];
        assert!(Analyzer::new().detect_circular_dependencies(&containers));
    }

    #[test]
    fn accepts_chain() {
        let containers = vec![
            container("a", &[]),
            container("b", &["a"]),
            container("c", &["b"]),
        ];
        assert!(!Analyzer::new().detect_circular_dependencies(&containers));
    }

    #[test]
    fn detects_duplicates() {
        let containers = vec![container("web1", &[]), container("web1", &[])];
        assert!(Analyzer::new().detect_duplicate_names(&containers));
    }

    #[test]
    fn detects_unknown_dependency() {
        let containers = vec![container("a", &["ghost"])];
        assert!(Analyzer::new().detect_unknown_dependencies(&containers));
    }

    #[test]
    fn required_from_is_exact_reverse_of_requires() {
        let mut containers = vec![
            container("a", &[]),
            container("b", &["a"]),
            container("c", &["a", "b"]),
        ];
        Analyzer::new().populate_required_from(&mut containers);

        let by_name = |name: &str| {
            containers
                .iter()
                .find(|c| c.service_name == name)
                .unwrap()
                .is_required_from
                .clone()
        };
        assert_eq!(
            by_name("a").into_iter().collect::<Vec<_>>(),
            ["b", "c"]
        );
        assert_eq!(by_name("b").into_iter().collect::<Vec<_>>(), ["c"]);
        assert!(by_name("c").is_empty());

        // Every reverse edge corresponds to a forward edge and vice versa.
        for c in &containers {
            for dependent in &c.is_required_from {
                let other = containers
                    .iter()
                    .find(|o| &o.service_name == dependent)
                    .unwrap();
                assert!(other.requires.contains(&c.service_name));
            }
            for dep in &c.requires {
                let other = containers.iter().find(|o| &o.service_name == dep).unwrap();
                assert!(other.is_required_from.contains(&c.service_name));
            }
        }
    }

    #[test]
    fn analyze_refuses_cycle() {
        let mut containers = vec![container("a", &["b"]), container("b", &["a"])];
        let err = Analyzer::new().analyze(&mut containers).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn analyze_refuses_duplicates() {
        let mut containers = vec![container("web1", &[]), container("web1", &[])];
        let err = Analyzer::new().analyze(&mut containers).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
