//! `docksmith.restart-after` handling: the transitive set of
//! containers to restart after a primary recreates, with cycle
//! refusal.

use std::collections::HashMap;

use docksmith_client::{
  entities::container::{Container, UpdatePolicy, labels},
  error::CoreError,
};

/// Dependents of `start`, in label-listed order, following chains
/// transitively. A cycle anywhere in the reachable graph is an
/// error ("dependency cycle") so nothing restarts forever.
/// The primary's own edge list is supplied directly so it works
/// even before discovery has seen the container.
pub fn restart_closure_seeded(
  containers: &[Container],
  start: &str,
  seed: &[String],
) -> Result<Vec<String>, CoreError> {
  let mut edges: HashMap<&str, Vec<String>> = containers
    .iter()
    .map(|container| {
      (
        container.name.as_str(),
        UpdatePolicy::from_labels(&container.labels).restart_after,
      )
    })
    .collect();
  edges.insert(start, seed.to_vec());
  closure_from(&edges, start)
}

fn closure_from(
  edges: &HashMap<&str, Vec<String>>,
  start: &str,
) -> Result<Vec<String>, CoreError> {
  let mut ordered = Vec::new();
  let mut path = vec![start.to_string()];
  walk(edges, start, &mut path, &mut ordered)?;
  Ok(ordered)
}

fn walk(
  edges: &HashMap<&str, Vec<String>>,
  node: &str,
  path: &mut Vec<String>,
  ordered: &mut Vec<String>,
) -> Result<(), CoreError> {
  let Some(next) = edges.get(node) else {
    return Ok(());
  };
  for dependent in next {
    if path.iter().any(|seen| seen == dependent) {
      return Err(CoreError::Validation(String::from(
        "dependency cycle",
      )));
    }
    if !ordered.iter().any(|seen| seen == dependent) {
      ordered.push(dependent.clone());
    }
    path.push(dependent.clone());
    walk(edges, dependent, path, ordered)?;
    path.pop();
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  fn container(name: &str, restart_after: &str) -> Container {
    let mut labels = HashMap::new();
    if !restart_after.is_empty() {
      labels.insert(
        labels::RESTART_AFTER.to_string(),
        restart_after.to_string(),
      );
    }
    Container {
      name: name.to_string(),
      labels,
      ..Default::default()
    }
  }

  fn seed(value: &str) -> Vec<String> {
    value
      .split(',')
      .filter(|name| !name.is_empty())
      .map(str::to_string)
      .collect()
  }

  #[test]
  fn transitive_closure_in_order() {
    let containers = vec![
      container("api", "proxy"),
      container("cache", ""),
      container("proxy", ""),
    ];
    let closure = restart_closure_seeded(
      &containers,
      "db",
      &seed("api,cache"),
    )
    .unwrap();
    assert_eq!(closure, vec!["api", "proxy", "cache"]);
  }

  #[test]
  fn detects_cycles() {
    let containers = vec![container("b", "a")];
    let err =
      restart_closure_seeded(&containers, "a", &seed("b"))
        .unwrap_err();
    assert_eq!(err.to_string(), "dependency cycle");
  }

  #[test]
  fn self_edge_is_a_cycle() {
    let containers = Vec::new();
    assert!(
      restart_closure_seeded(&containers, "a", &seed("a"))
        .is_err()
    );
  }

  #[test]
  fn no_dependents_is_empty() {
    let containers = vec![container("a", "")];
    assert_eq!(
      restart_closure_seeded(&containers, "a", &[]).unwrap(),
      Vec::<String>::new()
    );
  }

  #[test]
  fn seeded_closure_for_unseen_primary() {
    let containers = vec![container("proxy", "")];
    let closure = restart_closure_seeded(
      &containers,
      "web",
      &seed("proxy"),
    )
    .unwrap();
    assert_eq!(closure, vec!["proxy"]);
  }
}
