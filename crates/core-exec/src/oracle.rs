//! Out-of-date oracle (§4.7): `is_oodate` decides whether a node needs to be
//! rebuilt, probing the filesystem and updating the parent's `cmgn` as a side
//! effect the same way the original engine's `Make_OODate` does.

use core_graph::archive;
use core_model::{Graph, Handle, Kind, StateBits};
use core_vars::{NodeId, VarEngine};

fn node_id(h: Handle) -> NodeId {
    NodeId::from(h.as_u32())
}

fn probe(graph: &mut Graph, n: Handle) {
    let name = graph.node(n).name.clone();
    let mtime = std::fs::metadata(&name).and_then(|m| m.modified()).ok();
    graph.node_mut(n).mtime = mtime;
}

/// Bump `parent.cmgn` to `n` if `n`'s mtime is the newest child mtime seen
/// for `parent` so far (§4.7's "updates the parent's cmgn upward").
fn bump_parent_cmgn(graph: &mut Graph, n: Handle, parent: Option<Handle>) {
    let Some(p) = parent else { return };
    let n_mtime = graph.node(n).mtime;
    let should_update = match graph.node(p).cmgn {
        None => true,
        Some(c) => n_mtime > graph.node(c).mtime,
    };
    if should_update {
        graph.node_mut(p).cmgn = Some(n);
    }
}

/// §4.5a's out-of-date delegate for `lib` targets: compares the archive
/// member's stat mtime against `cmgn`, falling back to the
/// doubledep-with-no-children rule when there is no member to stat (a plain
/// archive file target rather than `lib(member)`, or a missing member).
fn lib_oodate(graph: &Graph, vars: &VarEngine, n: Handle) -> bool {
    let archive_path = vars.get_local(node_id(n), ".ARCHIVE");
    let member = vars.get_local(node_id(n), ".MEMBER");
    let doubledep_no_children = graph.node(n).kind.contains(Kind::DOUBLEDEP) && graph.node(n).children.is_empty();

    match (archive_path, member) {
        (Some(a), Some(m)) => match archive::arch_stat_member(a, m) {
            None => true,
            Some(stat) => {
                let stale = match graph.node(n).cmgn {
                    Some(c) => graph.node(c).mtime.map(|cm| stat.mtime < cm).unwrap_or(false),
                    None => doubledep_no_children,
                };
                stale
            }
        },
        _ => doubledep_no_children,
    }
}

/// Returns `true` under the first matching rule in §4.7. `parent`, if given,
/// has its `cmgn` updated when `n` turns out to be up to date.
pub fn is_oodate(graph: &mut Graph, vars: &VarEngine, n: Handle, parent: Option<Handle>) -> bool {
    let kind = graph.node(n).kind;

    if kind.intersects(Kind::USE | Kind::USEBEFORE) {
        return false;
    }

    if kind.contains(Kind::LIB) {
        probe(graph, n);
        let mtime_zero = graph.node(n).mtime.is_none();
        let is_archive = !mtime_zero && archive::is_valid_archive(&graph.node(n).name);
        if mtime_zero || is_archive {
            let result = lib_oodate(graph, vars, n);
            if !result {
                bump_parent_cmgn(graph, n, parent);
            }
            return result;
        }
    }

    if kind.contains(Kind::JOIN) {
        return graph
            .node(n)
            .children
            .iter()
            .any(|c| graph.node(*c).state.contains(StateBits::CHILDMADE));
    }

    if kind.intersects(Kind::FORCE | Kind::EXEC | Kind::PHONY) {
        return true;
    }

    probe(graph, n);
    let mtime = graph.node(n).mtime;
    let cmgn = graph.node(n).cmgn;

    if let Some(cmgn_h) = cmgn {
        let cmgn_mtime = graph.node(cmgn_h).mtime;
        if mtime < cmgn_mtime {
            return true;
        }
    } else {
        let optional = kind.contains(Kind::OPTIONAL);
        let doubledep = kind.contains(Kind::DOUBLEDEP);
        if (mtime.is_none() && !optional) || doubledep {
            return true;
        }
    }

    if graph.node(n).state.contains(StateBits::FORCE_FLAG) {
        return true;
    }

    bump_parent_cmgn(graph, n, parent);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_template_is_never_oodate() {
        let mut g = Graph::new();
        let vars = VarEngine::default();
        let n = g.get("template");
        g.node_mut(n).kind |= Kind::USE;
        assert!(!is_oodate(&mut g, &vars, n, None));
    }

    #[test]
    fn force_operator_is_always_oodate() {
        let mut g = Graph::new();
        let vars = VarEngine::default();
        let n = g.get("always");
        g.node_mut(n).kind |= Kind::FORCE;
        assert!(is_oodate(&mut g, &vars, n, None));
    }

    #[test]
    fn missing_file_with_no_children_is_oodate() {
        let mut g = Graph::new();
        let vars = VarEngine::default();
        let n = g.get("/definitely/does/not/exist/xyz");
        assert!(is_oodate(&mut g, &vars, n, None));
    }

    #[test]
    fn missing_optional_file_is_not_oodate() {
        let mut g = Graph::new();
        let vars = VarEngine::default();
        let n = g.get("/definitely/does/not/exist/xyz");
        g.node_mut(n).kind |= Kind::OPTIONAL;
        assert!(!is_oodate(&mut g, &vars, n, None));
    }

    #[test]
    fn existing_file_newer_than_cmgn_is_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let newer = dir.path().join("newer");
        let older = dir.path().join("older");
        std::fs::write(&older, "x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&newer, "x").unwrap();

        let mut g = Graph::new();
        let vars = VarEngine::default();
        let child = g.get(older.to_str().unwrap());
        let parent = g.get(newer.to_str().unwrap());
        is_oodate(&mut g, &vars, child, None);
        g.node_mut(parent).cmgn = Some(child);

        assert!(!is_oodate(&mut g, &vars, parent, None));
    }

    #[test]
    fn join_is_oodate_only_if_a_child_was_made() {
        let mut g = Graph::new();
        let vars = VarEngine::default();
        let n = g.get("joined");
        g.node_mut(n).kind |= Kind::JOIN;
        let c = g.get("c");
        g.add_edge(n, c);
        assert!(!is_oodate(&mut g, &vars, n, None));
        g.node_mut(c).state |= StateBits::CHILDMADE;
        assert!(is_oodate(&mut g, &vars, n, None));
    }

    #[test]
    fn up_to_date_node_bumps_parent_cmgn() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("f");
        std::fs::write(&f, "x").unwrap();

        let mut g = Graph::new();
        let vars = VarEngine::default();
        let n = g.get(f.to_str().unwrap());
        g.node_mut(n).kind |= Kind::OPTIONAL;
        let parent = g.get("parent");

        is_oodate(&mut g, &vars, n, Some(parent));
        assert_eq!(g.node(parent).cmgn, Some(n));
    }
}
