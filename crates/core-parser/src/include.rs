//! The `.include` frame stack (§4.3): one entry per open input file, plus the
//! single global conditional stack that spans the whole parse run so that an
//! `.if` opened in an included file can be balanced against an `.endif` back
//! in the includer (a makefile authoring mistake the parser must still catch).

use std::path::PathBuf;

use core_cond::CondStack;
use core_model::SearchPaths;

use crate::input::LineSource;

pub struct IFile {
    pub path: PathBuf,
    pub source: LineSource,
    /// `CondStack::depth()` at the moment this frame was pushed; on pop, the
    /// current depth must match or the file had an unbalanced `.if`.
    pub cond_depth_at_open: usize,
    /// `true` for the single frame opened from the command line / `-f`, as
    /// opposed to a nested `.include`.
    pub is_root: bool,
    /// `true` for a synthetic frame re-emitting a `.for` loop body (§9
    /// "Conditional + for-loop stack"), as opposed to a real `.include`.
    pub from_for_loop: bool,
    /// The physical line the frame was opened from (the `.include`/`.for`
    /// directive itself), used when reporting `.for` frames specially.
    pub first_line: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum IncludeError {
    #[error("{0}: unbalanced .if/.endif across include boundary")]
    UnbalancedConditional(String),
    #[error("could not find include file `{0}`")]
    NotFound(String),
    #[error("could not read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`.include` nesting exceeded {0} levels (likely a self-including loop)")]
    TooDeep(usize),
}

const MAX_INCLUDE_DEPTH: usize = 64;

/// Owns the stack of open input frames and the one [`CondStack`] shared by
/// all of them.
pub struct IncludeStack {
    pub frames: Vec<IFile>,
    pub cond: CondStack,
}

impl IncludeStack {
    pub fn new() -> Self {
        IncludeStack {
            frames: Vec::new(),
            cond: CondStack::new(),
        }
    }

    pub fn push_root(&mut self, path: PathBuf, contents: &str) {
        self.frames.push(IFile {
            path,
            source: LineSource::new(contents),
            cond_depth_at_open: self.cond.depth(),
            is_root: true,
            from_for_loop: false,
            first_line: 1,
        });
    }

    /// Push a synthetic frame that re-emits an already-expanded `.for` loop
    /// body (§4.2 item 1, §9). `opened_at` is the physical line of the `.for`
    /// directive itself, kept for diagnostics.
    pub fn push_for_loop(&mut self, body: &str, opened_at: u32) {
        let path = self
            .current_path()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<for>"));
        self.frames.push(IFile {
            path,
            source: LineSource::new(body),
            cond_depth_at_open: self.cond.depth(),
            is_root: false,
            from_for_loop: true,
            first_line: opened_at,
        });
    }

    /// Resolve `name` (bracket-quoted files search only `paths`; quoted files
    /// also check the includer's own directory first per §4.3) and push a new
    /// frame, reading its contents from disk.
    pub fn push_include(
        &mut self,
        name: &str,
        bracket: bool,
        paths: &SearchPaths,
    ) -> Result<(), IncludeError> {
        if self.frames.len() >= MAX_INCLUDE_DEPTH {
            return Err(IncludeError::TooDeep(MAX_INCLUDE_DEPTH));
        }

        let resolved = if !bracket {
            let local = self
                .frames
                .last()
                .and_then(|f| f.path.parent())
                .map(|dir| dir.join(name));
            local
                .filter(|p| p.exists())
                .or_else(|| paths.resolve(name))
        } else {
            paths.resolve(name)
        };

        let resolved = resolved.ok_or_else(|| IncludeError::NotFound(name.to_string()))?;
        let contents = std::fs::read_to_string(&resolved).map_err(|source| IncludeError::Io {
            path: resolved.clone(),
            source,
        })?;

        self.frames.push(IFile {
            path: resolved,
            source: LineSource::new(&contents),
            cond_depth_at_open: self.cond.depth(),
            is_root: false,
            from_for_loop: false,
            first_line: 1,
        });
        Ok(())
    }

    /// Pop the exhausted top frame, checking that it didn't leave the
    /// conditional stack unbalanced.
    pub fn pop(&mut self) -> Result<Option<IFile>, IncludeError> {
        let Some(frame) = self.frames.pop() else {
            return Ok(None);
        };
        if self.cond.depth() != frame.cond_depth_at_open {
            return Err(IncludeError::UnbalancedConditional(
                frame.path.display().to_string(),
            ));
        }
        Ok(Some(frame))
    }

    pub fn current_mut(&mut self) -> Option<&mut IFile> {
        self.frames.last_mut()
    }

    pub fn current_path(&self) -> Option<&PathBuf> {
        self.frames.last().map(|f| &f.path)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for IncludeStack {
    fn default() -> Self {
        Self::new()
    }
}
