//! Per-root transition tables: adjacency, job class per edge, and the
//! shortest route between every reachable pair of states.

use std::collections::HashMap;

use crate::error::SchedulingError;

#[derive(Debug, Clone, Default)]
pub struct StateTables {
    kind: String,
    states: Vec<String>,
    /// state → adjacent states, in job registration order.
    transition_options: HashMap<String, Vec<String>>,
    job_class_map: HashMap<(String, String), String>,
    route_map: HashMap<(String, String), Vec<String>>,
    /// state → every state reachable from it, in first-seen order.
    transition_map: HashMap<String, Vec<String>>,
}

impl StateTables {
    /// `transitions` are `(old_states, new_state, job_class)` triples of the
    /// state-change jobs declared against this root.
    pub fn build<'a>(
        kind: &str,
        states: &[String],
        transitions: impl IntoIterator<Item = (&'a [String], &'a str, &'a str)>,
    ) -> Result<Self, SchedulingError> {
        let mut tables = StateTables {
            kind: kind.to_string(),
            states: states.to_vec(),
            ..Default::default()
        };

        for (old_states, new_state, class) in transitions {
            tables.check_member(new_state)?;
            for old in old_states {
                tables.check_member(old)?;
                let key = (old.clone(), new_state.to_string());
                if let Some(existing) = tables.job_class_map.get(&key) {
                    return Err(SchedulingError::Schema(format!(
                        "{kind}: {old}->{new_state} declared by both {existing} and {class}"
                    )));
                }
                tables
                    .transition_options
                    .entry(old.clone())
                    .or_default()
                    .push(new_state.to_string());
                tables.job_class_map.insert(key, class.to_string());
            }
        }

        for begin in states {
            let mut candidates = Vec::new();
            let mut prefix = vec![begin.clone()];
            tables.walk(&mut prefix, &mut candidates);

            let mut reachable: Vec<String> = Vec::new();
            for route in candidates {
                let Some(end) = route.last().cloned() else {
                    continue;
                };
                let key = (begin.clone(), end.clone());
                match tables.route_map.get(&key) {
                    Some(best) if best.len() <= route.len() => {}
                    Some(_) => {
                        tables.route_map.insert(key, route);
                    }
                    None => {
                        reachable.push(end);
                        tables.route_map.insert(key, route);
                    }
                }
            }
            tables.transition_map.insert(begin.clone(), reachable);
        }

        Ok(tables)
    }

    /// Depth-first enumeration of every simple path extending `prefix`.
    fn walk(&self, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
        let Some(last) = prefix.last().cloned() else {
            return;
        };
        let Some(options) = self.transition_options.get(&last) else {
            return;
        };
        for option in options {
            if prefix.contains(option) {
                continue;
            }
            prefix.push(option.clone());
            out.push(prefix.clone());
            self.walk(prefix, out);
            prefix.pop();
        }
    }

    fn check_member(&self, state: &str) -> Result<(), SchedulingError> {
        if self.states.iter().any(|s| s == state) {
            Ok(())
        } else {
            Err(SchedulingError::InvalidState {
                kind: self.kind.clone(),
                state: state.to_string(),
                legal: self.states.clone(),
            })
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn get_route(&self, begin: &str, end: &str) -> Result<Vec<String>, SchedulingError> {
        self.check_member(begin)?;
        self.check_member(end)?;
        if begin == end {
            return Ok(vec![begin.to_string()]);
        }
        self.route_map
            .get(&(begin.to_string(), end.to_string()))
            .cloned()
            .ok_or_else(|| SchedulingError::NoRoute {
                kind: self.kind.clone(),
                from: begin.to_string(),
                to: end.to_string(),
            })
    }

    pub fn job_class(&self, from: &str, to: &str) -> Option<&str> {
        self.job_class_map
            .get(&(from.to_string(), to.to_string()))
            .map(String::as_str)
    }

    /// States adjacent to `state` by a single job.
    pub fn transition_options(&self, state: &str) -> &[String] {
        self.transition_options
            .get(state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every state reachable from `begin`.
    pub fn reachable_from(&self, begin: &str) -> &[String] {
        self.transition_map
            .get(begin)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn tables(all: &[&str], edges: &[(&[&str], &str, &str)]) -> StateTables {
        let owned: Vec<(Vec<String>, String, String)> = edges
            .iter()
            .map(|(old, new, class)| (states(old), new.to_string(), class.to_string()))
            .collect();
        StateTables::build(
            "target",
            &states(all),
            owned
                .iter()
                .map(|(o, n, c)| (o.as_slice(), n.as_str(), c.as_str())),
        )
        .unwrap()
    }

    #[test]
    fn multi_hop_route() {
        let t = tables(
            &["a", "b", "c"],
            &[(&["a"], "b", "AToB"), (&["b"], "c", "BToC")],
        );
        assert_eq!(t.get_route("a", "c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(t.reachable_from("a"), ["b", "c"]);
        assert!(t.reachable_from("c").is_empty());
    }

    #[test]
    fn every_hop_has_a_job_class() {
        let t = tables(
            &["unformatted", "formatted", "registered", "unmounted", "mounted", "removed"],
            &[
                (&["unformatted"], "formatted", "FormatTargetJob"),
                (&["formatted"], "registered", "RegisterTargetJob"),
                (&["registered"], "unmounted", "ConfigureTargetJob"),
                (&["unmounted"], "mounted", "MountTargetJob"),
                (&["mounted"], "unmounted", "UnmountTargetJob"),
                (&["unmounted", "unformatted", "formatted", "registered"], "removed", "RemoveTargetJob"),
            ],
        );
        for begin in t.states() {
            for end in t.reachable_from(begin) {
                let route = t.get_route(begin, end).unwrap();
                assert_eq!(route.first(), Some(begin));
                assert_eq!(route.last(), Some(end));
                for pair in route.windows(2) {
                    assert!(t.job_class(&pair[0], &pair[1]).is_some());
                }
            }
        }
        assert_eq!(
            t.get_route("mounted", "removed").unwrap(),
            vec!["mounted", "unmounted", "removed"]
        );
    }

    #[test]
    fn shortest_route_wins_and_ties_keep_first_seen() {
        let t = tables(
            &["a", "b", "c", "d"],
            &[
                (&["a"], "b", "AB"),
                (&["a"], "c", "AC"),
                (&["b"], "d", "BD"),
                (&["c"], "d", "CD"),
                (&["a"], "d", "AD"),
            ],
        );
        assert_eq!(t.get_route("a", "d").unwrap(), vec!["a", "d"]);

        let t = tables(
            &["a", "b", "c", "d"],
            &[
                (&["a"], "b", "AB"),
                (&["a"], "c", "AC"),
                (&["b"], "d", "BD"),
                (&["c"], "d", "CD"),
            ],
        );
        assert_eq!(t.get_route("a", "d").unwrap(), vec!["a", "b", "d"]);
    }

    #[test]
    fn cycles_do_not_loop() {
        let t = tables(
            &["stopped", "started"],
            &[(&["stopped"], "started", "Start"), (&["started"], "stopped", "Stop")],
        );
        assert_eq!(t.get_route("started", "stopped").unwrap(), vec!["started", "stopped"]);
        assert_eq!(t.reachable_from("stopped"), ["started"]);
    }

    #[test]
    fn errors_for_bad_states_and_routes() {
        let t = tables(&["a", "b", "c"], &[(&["a"], "b", "AB")]);
        assert!(matches!(
            t.get_route("a", "zzz"),
            Err(SchedulingError::InvalidState { .. })
        ));
        assert!(matches!(
            t.get_route("b", "a"),
            Err(SchedulingError::NoRoute { .. })
        ));
    }

    #[test]
    fn duplicate_edge_is_schema_error() {
        let result = StateTables::build(
            "t",
            &states(&["a", "b"]),
            vec![
                (states(&["a"]).as_slice(), "b", "One"),
                (states(&["a"]).as_slice(), "b", "Two"),
            ],
        );
        assert!(matches!(result, Err(SchedulingError::Schema(_))));
    }
}
