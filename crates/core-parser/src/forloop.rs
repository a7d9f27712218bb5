//! `.for`/`.endfor` macro loops (§4.2 "INVALID" branch): accumulate the raw
//! loop body through the matching `.endfor`, then expand it once per
//! iteration, substituting only the loop's own bound variable(s) — never a
//! full variable-substitution pass, since body lines may reference per-node
//! variables (`.TARGET`, `.ALLSRC`) that don't resolve until dispatch time.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ForLoopError {
    #[error(".for with no loop variable")]
    NoVariable,
    #[error(".for missing `in` keyword")]
    MissingIn,
    #[error("word count in `.for` list is not a multiple of the variable count ({0})")]
    ListNotMultiple(usize),
    #[error(".for with no matching .endfor")]
    UnterminatedFor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForHeader {
    pub vars: Vec<String>,
    pub items: Vec<Vec<String>>,
}

/// Parse the header line of a `.for VAR [VAR2 ...] in WORD WORD ...`
/// directive (the `for` keyword itself already stripped by the caller).
pub fn parse_for_header(rest: &str) -> Result<ForHeader, ForLoopError> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let in_pos = tokens.iter().position(|t| *t == "in").ok_or(ForLoopError::MissingIn)?;
    if in_pos == 0 {
        return Err(ForLoopError::NoVariable);
    }
    let vars: Vec<String> = tokens[..in_pos].iter().map(|s| s.to_string()).collect();
    let words: Vec<String> = tokens[in_pos + 1..].iter().map(|s| s.to_string()).collect();

    if !words.is_empty() && words.len() % vars.len() != 0 {
        return Err(ForLoopError::ListNotMultiple(vars.len()));
    }
    let items: Vec<Vec<String>> = words.chunks(vars.len()).map(|c| c.to_vec()).collect();
    Ok(ForHeader { vars, items })
}

/// Given the accumulated raw body lines and a parsed header, produce the
/// flattened set of expanded body lines, one iteration after another.
pub fn expand_for_body(header: &ForHeader, body: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(body.len() * header.items.len().max(1));
    for iteration in &header.items {
        for line in body {
            out.push(substitute_loop_vars(line, &header.vars, iteration));
        }
    }
    out
}

/// Replace `$(VAR)`/`${VAR}`/`$VAR` occurrences of any of `vars` with the
/// corresponding word from `values`, leaving every other `$`-expression (in
/// particular any reference to a real makefile variable) untouched.
fn substitute_loop_vars(line: &str, vars: &[String], values: &[String]) -> String {
    let bytes = line.as_bytes();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            if let Some((name, consumed)) = read_var_ref(line, i) {
                if let Some(pos) = vars.iter().position(|v| v == name) {
                    out.push_str(&values[pos]);
                    i += consumed;
                    continue;
                }
                out.push_str(&line[i..i + consumed]);
                i += consumed;
                continue;
            }
        }
        let len = line[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
        out.push_str(&line[i..i + len]);
        i += len;
    }
    out
}

/// Read a `$(NAME)`, `${NAME}`, or `$X` reference starting at `i`, returning
/// the bare name and the total byte length consumed.
fn read_var_ref(line: &str, i: usize) -> Option<(&str, usize)> {
    let bytes = line.as_bytes();
    let (open, close) = match bytes.get(i + 1)? {
        b'(' => (b'(', b')'),
        b'{' => (b'{', b'}'),
        _ => {
            let name_end = i + 1 + line[i + 1..].chars().next()?.len_utf8();
            return Some((&line[i + 1..name_end], name_end - i));
        }
    };
    let mut depth = 1;
    let mut j = i + 2;
    while j < bytes.len() {
        if bytes[j] == open {
            depth += 1;
        } else if bytes[j] == close {
            depth -= 1;
            if depth == 0 {
                return Some((&line[i + 2..j], j + 1 - i));
            }
        }
        j += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_variable_loop() {
        let h = parse_for_header("i in 1 2 3").unwrap();
        assert_eq!(h.vars, vec!["i"]);
        assert_eq!(h.items, vec![vec!["1"], vec!["2"], vec!["3"]]);
    }

    #[test]
    fn paired_variable_loop() {
        let h = parse_for_header("a b in 1 x 2 y").unwrap();
        assert_eq!(h.vars, vec!["a", "b"]);
        assert_eq!(h.items, vec![vec!["1", "x"], vec!["2", "y"]]);
    }

    #[test]
    fn odd_word_count_is_rejected() {
        let err = parse_for_header("a b in 1 x 2").unwrap_err();
        assert_eq!(err, ForLoopError::ListNotMultiple(2));
    }

    #[test]
    fn missing_in_is_rejected() {
        assert_eq!(parse_for_header("i 1 2 3").unwrap_err(), ForLoopError::MissingIn);
    }

    #[test]
    fn body_expands_once_per_iteration_substituting_only_loop_vars() {
        let h = parse_for_header("i in a b").unwrap();
        let body = vec!["target-$(i): $(i).c".to_string(), "\t$(CC) -o $@ $(i).c".to_string()];
        let expanded = expand_for_body(&h, &body);
        assert_eq!(
            expanded,
            vec![
                "target-a: a.c",
                "\t$(CC) -o $@ a.c",
                "target-b: b.c",
                "\t$(CC) -o $@ b.c",
            ]
        );
    }
}
