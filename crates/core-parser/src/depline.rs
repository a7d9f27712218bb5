//! Dependency lines (§4.2.2): `TARGETS OP [SOURCES] [; INLINE_CMD]`, and the
//! table of special-target keywords that switch the line into special mode.

use core_model::{Graph, Handle, Kind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Depends,  // :
    DoubleDep, // ::
    Force,     // !
}

impl Operator {
    fn to_kind(self) -> Kind {
        match self {
            Operator::Depends => Kind::DEPENDS,
            Operator::DoubleDep => Kind::DOUBLEDEP,
            Operator::Force => Kind::FORCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepLine {
    pub targets: Vec<String>,
    pub op: Operator,
    pub sources: Vec<String>,
    pub inline_cmd: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DepLineError {
    #[error("no operator (`:`, `::`, or `!`) found in dependency line")]
    NoOperator,
    #[error("mixing a special target with a mundane target on the same line")]
    MixedSpecialAndMundane,
    #[error("target `{0}` already has operator `{1:?}`, cannot also be `{2:?}`")]
    OperatorConflict(String, Kind, Kind),
}

/// Split a dependency line on its first top-level `:`/`::`/`!`, honoring a
/// leading `::` before falling back to a single `:`.
pub fn parse_dep_line(line: &str) -> Result<DepLine, DepLineError> {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut op_at = None;
    while i < bytes.len() {
        match bytes[i] {
            b'!' => {
                op_at = Some((i, Operator::Force, 1));
                break;
            }
            b':' => {
                if bytes.get(i + 1) == Some(&b':') {
                    op_at = Some((i, Operator::DoubleDep, 2));
                } else {
                    op_at = Some((i, Operator::Depends, 1));
                }
                break;
            }
            _ => i += 1,
        }
    }
    let (pos, op, len) = op_at.ok_or(DepLineError::NoOperator)?;

    let targets: Vec<String> = line[..pos].split_whitespace().map(String::from).collect();
    let rest = &line[pos + len..];
    let (sources_part, inline_cmd) = match rest.find(';') {
        Some(semi) => (&rest[..semi], Some(rest[semi + 1..].trim().to_string())),
        None => (rest, None),
    };
    let sources: Vec<String> = sources_part.split_whitespace().map(String::from).collect();

    Ok(DepLine {
        targets,
        op,
        sources,
        inline_cmd,
    })
}

/// The special-target keyword table (§4.2.2). `None` means `name` is a
/// mundane target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    Hook,
    Default,
    DeleteOnError,
    GlobalOrAttr(Kind),
    Attr(Kind),
    Main,
    NotParallel,
    SingleShell,
    Suffixes,
    Null,
    Path,
    PathSuffix,
    IncludesOrLibs,
    Order,
    Wait,
    Configure,
}

pub fn classify_special(name: &str) -> Option<Special> {
    use Special::*;
    Some(match name {
        ".BEGIN" | ".END" | ".INTERRUPT" | ".STALE" | ".ERROR" => Hook,
        ".DEFAULT" => Default,
        ".DELETE_ON_ERROR" => DeleteOnError,
        ".IGNORE" => GlobalOrAttr(Kind::IGNORE),
        ".SILENT" => GlobalOrAttr(Kind::SILENT),
        ".PRECIOUS" => GlobalOrAttr(Kind::PRECIOUS),
        ".PHONY" => Attr(Kind::PHONY),
        ".NOPATH" => Attr(Kind::NOPATH),
        ".NOTMAIN" => Attr(Kind::NOTMAIN),
        ".OPTIONAL" => Attr(Kind::OPTIONAL),
        ".MAKE" => Attr(Kind::MAKE),
        ".MADE" => Attr(Kind::MADE_ATTR),
        ".META" => Attr(Kind::META),
        ".NOMETA" => Attr(Kind::NOMETA),
        ".NOMETA_CMP" => Attr(Kind::NOMETA_CMP),
        ".USE" => Attr(Kind::USE),
        ".USEBEFORE" => Attr(Kind::USEBEFORE),
        ".INVISIBLE" => Attr(Kind::INVISIBLE),
        ".JOIN" => Attr(Kind::JOIN),
        ".EXEC" => Attr(Kind::EXEC),
        ".MAIN" => Main,
        ".NOTPARALLEL" | ".NO_PARALLEL" => NotParallel,
        ".SINGLESHELL" => SingleShell,
        ".SUFFIXES" => Suffixes,
        ".NULL" => Null,
        ".PATH" => Path,
        s if s.starts_with(".PATH.") => PathSuffix,
        ".INCLUDES" | ".LIBS" => IncludesOrLibs,
        ".ORDER" => Order,
        ".WAIT" => Wait,
        ".OBJDIR" | ".SHELL" | ".POSIX" | ".MAKEFLAGS" | ".MFLAGS" => Configure,
        _ => return None,
    })
}

/// Returns `true` if any target name in `names` is a recognized special
/// keyword. Used to detect the "mixing special and mundane" error (§4.2.2).
pub fn any_special(names: &[String]) -> bool {
    names.iter().any(|n| classify_special(n).is_some())
}

pub fn all_special(names: &[String]) -> bool {
    !names.is_empty() && names.iter().all(|n| classify_special(n).is_some())
}

/// Apply `op` to `target`'s kind bits, rejecting a conflicting operator
/// class already set by an earlier line (§4.2.2 "Applying the operator").
/// For `::` the caller is responsible for creating a cohort instead of
/// reusing `target` directly; this only records the kind bits on whichever
/// node (centurion or cohort) the caller passes in.
pub fn apply_operator(graph: &mut Graph, target: Handle, op: Operator) -> Result<(), DepLineError> {
    let existing = graph.node(target).kind.operator();
    let new_op = op.to_kind();
    if !existing.is_empty() && existing != new_op {
        return Err(DepLineError::OperatorConflict(
            graph.node(target).name.clone(),
            existing,
            new_op,
        ));
    }
    graph.node_mut(target).kind |= new_op;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_depends_line() {
        let d = parse_dep_line("all: foo bar").unwrap();
        assert_eq!(d.targets, vec!["all"]);
        assert_eq!(d.op, Operator::Depends);
        assert_eq!(d.sources, vec!["foo", "bar"]);
        assert_eq!(d.inline_cmd, None);
    }

    #[test]
    fn doubledep_operator_preferred_over_single_colon() {
        let d = parse_dep_line("lib::obj.o").unwrap();
        assert_eq!(d.op, Operator::DoubleDep);
        assert_eq!(d.sources, vec!["obj.o"]);
    }

    #[test]
    fn force_operator() {
        let d = parse_dep_line("always! cmd.o").unwrap();
        assert_eq!(d.op, Operator::Force);
    }

    #[test]
    fn inline_command_after_semicolon() {
        let d = parse_dep_line("out: in ; echo building").unwrap();
        assert_eq!(d.sources, vec!["in"]);
        assert_eq!(d.inline_cmd.as_deref(), Some("echo building"));
    }

    #[test]
    fn no_operator_is_an_error() {
        assert_eq!(parse_dep_line("just text").unwrap_err(), DepLineError::NoOperator);
    }

    #[test]
    fn special_keyword_classification() {
        assert_eq!(classify_special(".PHONY"), Some(Special::Attr(Kind::PHONY)));
        assert_eq!(classify_special(".PATH.c"), Some(Special::PathSuffix));
        assert_eq!(classify_special("all"), None);
    }

    #[test]
    fn mixed_special_and_mundane_detected() {
        let names = vec![".PHONY".to_string(), "all".to_string()];
        assert!(any_special(&names));
        assert!(!all_special(&names));
    }

    #[test]
    fn operator_conflict_is_rejected() {
        let mut g = Graph::new();
        let t = g.get("x");
        apply_operator(&mut g, t, Operator::Depends).unwrap();
        let err = apply_operator(&mut g, t, Operator::Force).unwrap_err();
        assert!(matches!(err, DepLineError::OperatorConflict(..)));
    }

    #[test]
    fn reapplying_same_operator_is_fine() {
        let mut g = Graph::new();
        let t = g.get("x");
        apply_operator(&mut g, t, Operator::Depends).unwrap();
        apply_operator(&mut g, t, Operator::Depends).unwrap();
        assert!(g.node(t).kind.contains(Kind::DEPENDS));
    }
}
