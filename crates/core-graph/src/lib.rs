//! Graph expansion (§4.6): the breadth-first pre-run pass that turns the
//! parser's raw dependency graph into one ready for the scheduler — probing
//! mtimes, applying `.USE`/`.USEBEFORE` templates, discovering suffix-rule
//! dependencies, converting `.WAIT` markers into order edges, and finally
//! hanging everything off a synthetic `.MAIN` parent.

pub mod archive;

use std::collections::{HashSet, VecDeque};
use std::fs;

use core_model::{Graph, Handle, Kind, StateBits};
use core_vars::{NodeId, VarEngine};

fn node_id(h: Handle) -> NodeId {
    NodeId::from(h.as_u32())
}

/// Known suffixes (§4.6a) plus whatever `.DEFAULT` node the parser recorded.
/// The two-suffix rule nodes themselves (`.c.o`, ...) already live in the
/// graph as ordinary nodes — this struct only tracks the declaration order
/// needed to pick among them.
#[derive(Debug, Clone, Default)]
pub struct SuffixRules {
    pub suffixes: Vec<String>,
    pub default_node: Option<Handle>,
}

/// Run the full §4.6 expansion pass over `roots` (the targets this invocation
/// was asked to build) and return the synthetic `.MAIN` handle every root now
/// hangs off of.
pub fn expand(
    graph: &mut Graph,
    vars: &mut VarEngine,
    paths: &core_model::SearchPaths,
    rules: &SuffixRules,
    roots: &[Handle],
) -> Handle {
    let mut queue: VecDeque<Handle> = roots.iter().copied().collect();
    let mut visited: HashSet<Handle> = HashSet::new();

    while let Some(n) = queue.pop_front() {
        if visited.contains(&n) {
            continue;
        }
        visited.insert(n);
        graph.node_mut(n).state |= StateBits::REMAKE;

        if graph.node(n).kind.contains(Kind::DOUBLEDEP) {
            for c in graph.node(n).cohorts.clone() {
                queue.push_back(c);
            }
        }

        if let Some((arch, member)) = archive::parse_archive_member(&graph.node(n).name) {
            vars.set_local(node_id(n), ".ARCHIVE", &arch);
            vars.set_local(node_id(n), ".MEMBER", &member);
            graph.node_mut(n).kind |= Kind::ARCHV;
        }

        probe_mtime(graph, vars, n);
        apply_use_templates(graph, vars, n);

        if !graph.node(n).kind.contains(Kind::MADE_ATTR) {
            discover_suffix_rule(graph, paths, rules, n);
        }

        for c in graph.node(n).children.clone() {
            let ck = graph.node(c).kind;
            if !visited.contains(&c) && !ck.contains(Kind::USE) && !ck.contains(Kind::USEBEFORE) {
                queue.push_back(c);
            }
        }
    }

    convert_wait_markers(graph, &visited);
    insert_synthetic_main(graph, roots)
}

fn probe_mtime(graph: &mut Graph, vars: &mut VarEngine, n: Handle) {
    let name = graph.node(n).name.clone();
    vars.set_local(node_id(n), ".TARGET", &name);
    let mtime = fs::metadata(&name).and_then(|m| m.modified()).ok();
    graph.node_mut(n).mtime = mtime;
}

/// §4.6 item 5. Templates are consumed into `n`'s own commands/children and
/// the `n -> template` edge removed; a template may still be reused by any
/// other node that references it, since nothing here mutates the template
/// itself beyond reading it. A local `seen` set guards only against `n`
/// listing the same template twice (e.g. a duplicate dependency-line entry).
fn apply_use_templates(graph: &mut Graph, vars: &VarEngine, n: Handle) {
    let children = graph.node(n).children.clone();
    let mut seen = HashSet::new();

    for u in children {
        let kind = graph.node(u).kind;
        let is_use = kind.contains(Kind::USE);
        let is_usebefore = kind.contains(Kind::USEBEFORE);
        if !is_use && !is_usebefore {
            continue;
        }
        if !seen.insert(u) {
            continue;
        }

        let template_commands = graph.node(u).commands.clone();
        if is_usebefore {
            let mut combined = template_commands.clone();
            combined.extend(graph.node(n).commands.clone());
            graph.node_mut(n).commands = combined;
        } else if graph.node(n).commands.is_empty() {
            graph.node_mut(n).commands.extend(template_commands.clone());
        }

        let template_children: Vec<String> = graph
            .node(u)
            .children
            .iter()
            .map(|c| graph.node(*c).name.clone())
            .collect();
        for raw_name in template_children {
            let expanded = vars.subst(&raw_name, Some(node_id(n)));
            let child = graph.get(&expanded);
            graph.add_edge(n, child);
        }

        let propagated = graph.node(u).kind.propagated() - Kind::USE - Kind::USEBEFORE - Kind::TRANSFORM;
        graph.node_mut(n).kind |= propagated;

        graph.remove_child(n, u);
        graph.recompute_unmade(n);
    }
}

/// §4.6a. Runs once per node (guarded by `Kind::DEPS_FOUND`).
fn discover_suffix_rule(graph: &mut Graph, paths: &core_model::SearchPaths, rules: &SuffixRules, n: Handle) {
    if graph.node(n).kind.contains(Kind::DEPS_FOUND) {
        return;
    }
    graph.node_mut(n).kind |= Kind::DEPS_FOUND;

    if !graph.node(n).commands.is_empty() {
        return;
    }
    let name = graph.node(n).name.clone();

    if let Some(to) = rules.suffixes.iter().find(|s| name.ends_with(s.as_str())).cloned() {
        let stem = &name[..name.len() - to.len()];
        for from in &rules.suffixes {
            if *from == to {
                continue;
            }
            let rule_name = format!("{from}{to}");
            let Some(rule) = graph.find(&rule_name) else {
                continue;
            };
            let prereq_name = format!("{stem}{from}");
            if paths.resolve(&prereq_name).is_some() {
                let prereq = graph.get(&prereq_name);
                graph.node_mut(prereq).implicit_parents.push(n);
                graph.add_edge(n, prereq);
                let rule_commands = graph.node(rule).commands.clone();
                graph.node_mut(n).commands = rule_commands;
                graph.recompute_unmade(n);
                return;
            }
        }
    }

    if graph.node(n).commands.is_empty() && graph.node(n).children.is_empty() {
        if let Some(default) = rules.default_node {
            let commands = graph.node(default).commands.clone();
            graph.node_mut(n).commands = commands;
        }
    }
}

/// Second pass of §4.6: each `.WAIT` child gets an order edge from every
/// preceding non-`.WAIT` sibling since the previous `.WAIT` in the same
/// parent's child list.
fn convert_wait_markers(graph: &mut Graph, visited: &HashSet<Handle>) {
    for &n in visited {
        let children = graph.node(n).children.clone();
        let mut pending = Vec::new();
        for c in children {
            if graph.node(c).kind.contains(Kind::WAIT) {
                for p in &pending {
                    graph.add_order_edge(*p, c);
                }
                pending.clear();
            } else {
                pending.push(c);
            }
        }
    }
}

fn insert_synthetic_main(graph: &mut Graph, roots: &[Handle]) -> Handle {
    let main = graph.new_internal(".MAIN");
    graph.node_mut(main).kind |= Kind::SPECIAL | Kind::NOTMAIN;
    graph.node_mut(main).state |= StateBits::REMAKE;
    for r in roots {
        graph.add_edge(main, *r);
    }
    graph.recompute_unmade(main);
    main
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::SearchPaths;

    #[test]
    fn use_template_commands_and_children_are_copied_and_edge_removed() {
        let mut g = Graph::new();
        let mut vars = VarEngine::default();
        let template = g.get("template");
        g.node_mut(template).kind |= Kind::USE;
        g.node_mut(template).commands.push("echo used".to_string());
        let tchild = g.get("tchild");
        g.add_edge(template, tchild);

        let foo = g.get("foo");
        g.add_edge(foo, template);
        g.recompute_unmade(foo);

        let rules = SuffixRules::default();
        let paths = SearchPaths::new();
        expand(&mut g, &mut vars, &paths, &rules, &[foo]);

        assert_eq!(g.node(foo).commands, vec!["echo used".to_string()]);
        assert!(!g.node(foo).children.contains(&template));
        assert!(g.node(foo).children.contains(&tchild));
    }

    #[test]
    fn usebefore_prepends_even_when_target_has_commands() {
        let mut g = Graph::new();
        let mut vars = VarEngine::default();
        let foo = g.get("foo");
        g.node_mut(foo).commands.push("own cmd".to_string());
        let template = g.get("template");
        g.node_mut(template).kind |= Kind::USEBEFORE;
        g.node_mut(template).commands.push("before cmd".to_string());
        g.add_edge(foo, template);

        let rules = SuffixRules::default();
        let paths = SearchPaths::new();
        expand(&mut g, &mut vars, &paths, &rules, &[foo]);

        assert_eq!(
            g.node(foo).commands,
            vec!["before cmd".to_string(), "own cmd".to_string()]
        );
    }

    #[test]
    fn wait_markers_become_order_edges_from_preceding_siblings() {
        let mut g = Graph::new();
        let mut vars = VarEngine::default();
        let all = g.get("all");
        let a = g.get("a");
        let wait = g.new_internal(".WAIT");
        g.node_mut(wait).kind |= Kind::WAIT | Kind::PHONY;
        let b = g.get("b");
        g.add_edge(all, a);
        g.add_edge(all, wait);
        g.add_edge(all, b);

        let rules = SuffixRules::default();
        let paths = SearchPaths::new();
        expand(&mut g, &mut vars, &paths, &rules, &[all]);

        assert_eq!(g.node(a).order_succ, vec![wait]);
        assert!(g.node(b).order_succ.is_empty());
    }

    #[test]
    fn synthetic_main_hangs_every_root_off_one_parent() {
        let mut g = Graph::new();
        let mut vars = VarEngine::default();
        let a = g.get("a");
        let b = g.get("b");
        let rules = SuffixRules::default();
        let paths = SearchPaths::new();
        let main = expand(&mut g, &mut vars, &paths, &rules, &[a, b]);

        assert_eq!(g.node(main).children, vec![a, b]);
        assert!(g.node(main).kind.contains(Kind::SPECIAL));
    }

    #[test]
    fn suffix_rule_fills_in_commands_and_implicit_parent() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("foo").display().to_string();
        std::fs::write(format!("{stem}.c"), "int main(){}").unwrap();

        let mut g = Graph::new();
        let mut vars = VarEngine::default();
        let rule = g.get(".c.o");
        g.node_mut(rule).commands.push("cc -c $(.TARGET)".to_string());

        let target = g.get(&format!("{stem}.o"));
        let rules = SuffixRules {
            suffixes: vec![".o".to_string(), ".c".to_string()],
            default_node: None,
        };
        let paths = SearchPaths::new();
        expand(&mut g, &mut vars, &paths, &rules, &[target]);

        assert_eq!(g.node(target).commands, vec!["cc -c $(.TARGET)".to_string()]);
        let prereq = g.find(&format!("{stem}.c")).unwrap();
        assert!(g.node(target).children.contains(&prereq));
        assert!(g.node(prereq).implicit_parents.contains(&target));
    }

    #[test]
    fn empty_suffixes_list_never_matches() {
        let mut g = Graph::new();
        let mut vars = VarEngine::default();
        let target = g.get("foo.o");
        let rules = SuffixRules::default();
        let paths = SearchPaths::new();
        expand(&mut g, &mut vars, &paths, &rules, &[target]);
        assert!(g.node(target).commands.is_empty());
    }
}
