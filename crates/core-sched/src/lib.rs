//! The scheduler (§4.8): a single FIFO `toBeMade` queue driven by a
//! dispatch loop, completion propagation up through parents and cohort
//! groups, and the `.WAIT`/`.ORDER` ordering constraints layered on top of
//! plain child counting.
//!
//! Scheduling is single-threaded and cooperative (§5): this type owns the
//! graph and variable engine outright for the duration of a run. The only
//! blocking call anywhere in here is [`core_exec::JobRunner::recv`], reached
//! from [`Scheduler::run`]'s main loop between dispatch rounds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::SystemTime;

use core_diag::{Diagnostic, Diagnostics, TargetOutcome};
use core_exec::{is_oodate, Job, JobResult, JobRunner};
use core_model::{Graph, Handle, Kind, MadeStatus, StateBits};
use core_vars::{NodeId, VarEngine};
use tracing::{debug, trace, warn};

fn node_id(h: Handle) -> NodeId {
    NodeId::from(h.as_u32())
}

#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("no shell available to run `{target}`")]
    NoShell { target: String },
}

/// The handful of CLI-observed flags that change how the scheduler dispatches
/// (§6): everything else about a run is already baked into the graph.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub keep_going: bool,
    pub query_only: bool,
    pub silent: bool,
    pub ignore_errors: bool,
    pub touch_only: bool,
    pub no_execute: bool,
    pub delete_on_error: bool,
    pub shell: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            keep_going: false,
            query_only: false,
            silent: false,
            ignore_errors: false,
            touch_only: false,
            no_execute: false,
            delete_on_error: false,
            shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub jobs_run: usize,
    pub job_failures: usize,
    /// Only meaningful under [`SchedulerConfig::query_only`]: whether the
    /// scheduler found a node it would have dispatched.
    pub would_build: bool,
}

enum DispatchOutcome {
    Continue,
    QueryHit,
}

/// Final per-target line printed at the end of a run (§7), derived from
/// whatever state [`Scheduler::run`] left the node in.
pub fn outcome(graph: &Graph, h: Handle) -> TargetOutcome {
    match graph.node(h).made {
        MadeStatus::UpToDate => TargetOutcome::UpToDate,
        MadeStatus::Made => TargetOutcome::Made,
        MadeStatus::Error | MadeStatus::Aborted => TargetOutcome::ErrorInSelfOrDependency,
        _ => TargetOutcome::MissingPrerequisite,
    }
}

/// Drives one run's `toBeMade` queue to completion against `graph`.
pub struct Scheduler<'a> {
    graph: &'a mut Graph,
    vars: &'a mut VarEngine,
    runner: &'a JobRunner,
    diagnostics: &'a mut Diagnostics,
    config: SchedulerConfig,
    to_be_made: VecDeque<Handle>,
    checked: u64,
    in_flight: usize,
    aborting: bool,
    /// `.WAIT` node → (parent, index of the next sibling to resume at) once
    /// that barrier clears (§4.8's "stop scheduling further siblings").
    wait_resume: HashMap<Handle, (Handle, usize)>,
    summary: RunSummary,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a mut Graph,
        vars: &'a mut VarEngine,
        runner: &'a JobRunner,
        diagnostics: &'a mut Diagnostics,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            graph,
            vars,
            runner,
            diagnostics,
            config,
            to_be_made: VecDeque::new(),
            // A fresh `Node` also defaults `checked` to 0 (core-model's
            // `Node::new`), so the epoch sentinel must start disjoint from
            // that or the very first node popped would look "already
            // visited this round" and get deferred forever.
            checked: 1,
            in_flight: 0,
            aborting: false,
            wait_resume: HashMap::new(),
            summary: RunSummary::default(),
        }
    }

    /// Run the scheduler against `root` — typically the synthetic `.MAIN`
    /// node `core_graph::expand` hands back, whose children are the targets
    /// this invocation actually asked for.
    pub fn run(mut self, root: Handle) -> RunSummary {
        self.schedule_child(root, true);
        loop {
            match self.start_jobs() {
                DispatchOutcome::QueryHit => break,
                DispatchOutcome::Continue => {}
            }
            if self.to_be_made.is_empty() && self.in_flight == 0 {
                break;
            }
            if self.in_flight == 0 {
                // Nothing queued can make progress (every entry is blocked on
                // an order predecessor or a cycle) and nothing is in flight
                // to unblock it; further waiting would hang forever.
                break;
            }
            match self.runner.recv() {
                Ok(result) => self.handle_job_result(result),
                Err(_) => break,
            }
        }
        self.summary
    }

    fn order_pred_blocks(&self, c: Handle) -> bool {
        self.graph.node(c).order_pred.iter().any(|p| {
            let pn = self.graph.node(*p);
            pn.state.contains(StateBits::REMAKE) && pn.made < MadeStatus::Made
        })
    }

    /// `schedule_child` (§4.8): request `c` be built, deferring it instead if
    /// an `.ORDER` predecessor hasn't reached `MADE` yet.
    fn schedule_child(&mut self, c: Handle, front: bool) {
        if self.graph.node(c).made > MadeStatus::Deferred {
            return;
        }
        if self.order_pred_blocks(c) {
            self.graph.node_mut(c).made = MadeStatus::Deferred;
            return;
        }
        self.graph.node_mut(c).made = MadeStatus::Requested;
        if front {
            self.to_be_made.push_front(c);
        } else {
            self.to_be_made.push_back(c);
        }
        trace!(node = %self.graph.node(c).name, "requested");

        if self.graph.node(c).unmade_cohorts > 0 {
            let cohorts = self.graph.node(c).cohorts.clone();
            for co in cohorts {
                self.schedule_child(co, front);
            }
        }
    }

    /// Request every child of `parent` in declaration order, stopping at the
    /// first unfinished `.WAIT` barrier (§4.8, §5's sibling ordering
    /// guarantee). The remaining siblings resume once that barrier clears,
    /// via `wait_resume`.
    fn schedule_children(&mut self, parent: Handle, front: bool) {
        self.schedule_children_from(parent, 0, front);
    }

    fn schedule_children_from(&mut self, parent: Handle, start: usize, front: bool) {
        let children = self.graph.node(parent).children.clone();
        let mut i = start;
        while i < children.len() {
            let c = children[i];
            self.schedule_child(c, front);
            if self.graph.node(c).kind.contains(Kind::WAIT) && self.graph.node(c).made < MadeStatus::Made {
                self.wait_resume.insert(c, (parent, i + 1));
                return;
            }
            i += 1;
        }
    }

    /// `start_jobs` (§4.8): drain `toBeMade` until it is empty or the token
    /// pool is exhausted.
    fn start_jobs(&mut self) -> DispatchOutcome {
        loop {
            if self.aborting || self.to_be_made.is_empty() {
                return DispatchOutcome::Continue;
            }
            let Some(token) = self.runner.try_acquire() else {
                return DispatchOutcome::Continue;
            };

            let n = self.to_be_made.pop_front().unwrap();
            if self.graph.node(n).checked == self.checked {
                self.graph.node_mut(n).made = MadeStatus::Deferred;
                continue;
            }
            self.graph.node_mut(n).checked = self.checked;

            if self.graph.node(n).unmade > 0 {
                self.graph.node_mut(n).made = MadeStatus::Deferred;
                self.schedule_children(n, true);
                continue;
            }

            self.graph.node_mut(n).made = MadeStatus::BeingMade;
            let oodate = is_oodate(self.graph, self.vars, n, None);
            if oodate {
                if self.config.query_only {
                    self.summary.would_build = true;
                    return DispatchOutcome::QueryHit;
                }
                self.setup_dispatch_vars(n);
                let job = self.build_job(n);
                debug!(node = %job.name, "dispatching");
                if !job.commands.is_empty() {
                    self.summary.jobs_run += 1;
                }
                self.runner.dispatch(job, token);
                self.in_flight += 1;
            } else {
                drop(token);
                self.graph.node_mut(n).made = MadeStatus::UpToDate;
                self.on_complete(n);
            }
        }
    }

    fn build_job(&self, n: Handle) -> Job {
        let id = node_id(n);
        Job {
            node: n,
            name: self.graph.node(n).name.clone(),
            commands: self
                .graph
                .node(n)
                .commands
                .iter()
                .map(|c| self.vars.subst(c, Some(id)))
                .collect(),
            silent: self.config.silent || self.graph.node(n).kind.contains(Kind::SILENT),
            ignore_errors: self.config.ignore_errors || self.graph.node(n).kind.contains(Kind::IGNORE),
            delete_on_error: self.config.delete_on_error,
            touch_only: self.config.touch_only,
            no_execute: self.config.no_execute,
        }
    }

    /// §4.9: build `.ALLSRC`/`.OODATE` (and, for `.JOIN` targets, alias
    /// `.TARGET`) immediately before a node is handed to the runner. Guarded
    /// by `Kind::MARK` so a node visited twice in one run only pays for this
    /// once.
    fn setup_dispatch_vars(&mut self, n: Handle) {
        if self.graph.node(n).kind.contains(Kind::MARK) {
            return;
        }
        self.graph.node_mut(n).kind |= Kind::MARK;

        let is_join = self.graph.node(n).kind.contains(Kind::JOIN);
        let parent_mtime = self.graph.node(n).mtime;

        let mut allsrc = Vec::new();
        let mut oodate = Vec::new();

        for c in self.graph.node(n).children.clone() {
            let ck = self.graph.node(c).kind;
            if ck.intersects(Kind::EXEC | Kind::USE | Kind::USEBEFORE | Kind::INVISIBLE) {
                continue;
            }
            if is_join {
                for g in self.graph.node(c).children.clone() {
                    allsrc.push(self.graph.node(g).name.clone());
                }
                if self.graph.node(c).state.contains(StateBits::CHILDMADE) {
                    oodate.push(self.graph.node(c).name.clone());
                }
                continue;
            }
            allsrc.push(self.graph.node(c).name.clone());
            let freshly_made = self.graph.node(c).state.contains(StateBits::CHILDMADE);
            if freshly_made || self.graph.node(c).mtime >= parent_mtime {
                oodate.push(self.graph.node(c).name.clone());
            }
        }

        let allsrc = allsrc.join(" ");
        let oodate = oodate.join(" ");
        let id = node_id(n);
        self.vars.set_local(id, ".ALLSRC", &allsrc);
        self.vars.set_local(id, ".OODATE", &oodate);
        if is_join {
            self.vars.set_local(id, ".TARGET", &allsrc);
        }
    }

    fn handle_job_result(&mut self, result: JobResult) {
        self.in_flight -= 1;
        if result.success {
            self.graph.node_mut(result.node).made = MadeStatus::Made;
        } else {
            self.summary.job_failures += 1;
            self.graph.node_mut(result.node).made = MadeStatus::Error;
            self.report_once(result.node, format!("`{}' not made: command failed", self.graph.node(result.node).name));
            if !self.config.keep_going {
                self.aborting = true;
            }
        }
        self.on_complete(result.node);
    }

    fn report_once(&mut self, h: Handle, message: String) {
        if self.graph.node(h).state.contains(StateBits::REPORTED) {
            return;
        }
        self.graph.node_mut(h).state |= StateBits::REPORTED;
        let file = self.graph.node(h).provenance.file.clone();
        let line = self.graph.node(h).provenance.line;
        self.diagnostics.report(Diagnostic::fatal(file, line, message));
    }

    /// `on_complete` (§4.8): fan a finished node's result out to its cohort
    /// group, its `.ORDER` successors, its parents, and any implicit parent
    /// waiting on `.IMPSRC`/`.PREFIX`.
    fn on_complete(&mut self, c: Handle) {
        self.checked += 1;

        if self.graph.node(c).made != MadeStatus::UpToDate {
            probe_mtime(self.graph, c);
        }
        let is_wait = self.graph.node(c).kind.contains(Kind::WAIT);
        let forced = self.graph.node(c).mtime.is_none() && !is_wait;

        let centurion = self.graph.centurion_of(c);
        if self.graph.node(c).is_cohort() {
            self.graph.node_mut(centurion).unmade_cohorts -= 1;
        }

        for succ in self.graph.node(centurion).order_succ.clone() {
            self.schedule_child(succ, false);
        }

        if matches!(self.graph.node(c).made, MadeStatus::Error | MadeStatus::Aborted) {
            self.cascade_error(centurion);
        }

        let centurion_ready =
            self.graph.node(centurion).unmade_cohorts == 0 && self.graph.node(centurion).made >= MadeStatus::Made;
        if centurion_ready {
            let not_template = !self.graph.node(c).kind.intersects(Kind::USE | Kind::USEBEFORE);
            let made_status = self.graph.node(c).made;
            let childmade = not_template && made_status == MadeStatus::Made;
            let bump_cmgn = not_template && made_status.is_finished() && self.graph.node(c).mtime.is_some();
            let c_mtime = self.graph.node(c).mtime;
            for p in self.graph.node(centurion).parents.clone() {
                self.notify_parent(p, forced, childmade, bump_cmgn, c, c_mtime);
            }
        }

        for ip in self.graph.node(c).implicit_parents.clone() {
            self.set_impsrc_prefix(ip, c);
        }

        if is_wait {
            if let Some((parent, next)) = self.wait_resume.remove(&c) {
                self.schedule_children_from(parent, next, true);
            }
        }
    }

    fn notify_parent(
        &mut self,
        p: Handle,
        forced: bool,
        childmade: bool,
        bump_cmgn: bool,
        c: Handle,
        c_mtime: Option<SystemTime>,
    ) {
        if !self.graph.node(p).state.contains(StateBits::REMAKE) || self.graph.node(p).kind.contains(Kind::MADE_ATTR) {
            return;
        }
        if forced {
            self.graph.node_mut(p).state |= StateBits::FORCE_FLAG;
        }
        if childmade {
            self.graph.node_mut(p).state |= StateBits::CHILDMADE;
        }
        if bump_cmgn {
            let should_update = match self.graph.node(p).cmgn {
                None => true,
                Some(cur) => c_mtime > self.graph.node(cur).mtime,
            };
            if should_update {
                self.graph.node_mut(p).cmgn = Some(c);
            }
        }

        if self.graph.node(p).unmade == 0 {
            self.report_cycle(p);
            return;
        }
        self.graph.node_mut(p).unmade -= 1;
        if self.graph.node(p).unmade > 0 {
            return;
        }
        if self.graph.node(p).made != MadeStatus::Deferred {
            return;
        }
        if self.order_pred_blocks(p) {
            return;
        }
        self.graph.node_mut(p).made = MadeStatus::Requested;
        self.to_be_made.push_back(p);
    }

    fn set_impsrc_prefix(&mut self, parent: Handle, child: Handle) {
        let name = self.graph.node(child).name.clone();
        let id = node_id(parent);
        self.vars.set_local(id, ".IMPSRC", &name);
        let prefix = match name.rfind('.') {
            Some(i) => name[..i].to_string(),
            None => name.clone(),
        };
        self.vars.set_local(id, ".PREFIX", &prefix);
    }

    /// A parent's `unmade` dropping below zero means some child completed
    /// twice without the parent ever decrementing in between — only possible
    /// if the graph has a cycle back through `p`.
    fn report_cycle(&mut self, p: Handle) {
        if self.graph.node(p).state.contains(StateBits::DONECYCLE) {
            return;
        }
        self.graph.node_mut(p).state |= StateBits::CYCLE | StateBits::DONECYCLE;
        self.graph.node_mut(p).made = MadeStatus::Error;
        let names = find_cycle(self.graph, p);
        let file = self.graph.node(p).provenance.file.clone();
        let line = self.graph.node(p).provenance.line;
        self.diagnostics
            .report(Diagnostic::fatal(file, line, core_diag::format_cycle_report(&names)));
        warn!(node = %self.graph.node(p).name, "cycle detected");
    }

    /// Propagate a build failure up through parents without waiting for the
    /// rest of the scheduler's normal bookkeeping: under `-k` siblings still
    /// finish, but `p` and everything above it can never reach `MADE`.
    fn cascade_error(&mut self, h: Handle) {
        if self.graph.node(h).made == MadeStatus::Aborted {
            return;
        }
        if self.graph.node(h).made != MadeStatus::Error {
            self.graph.node_mut(h).made = MadeStatus::Aborted;
        }
        self.report_once(h, format!("`{}' not made due to error", self.graph.node(h).name));
        for p in self.graph.node(h).parents.clone() {
            let centurion = self.graph.centurion_of(p);
            self.cascade_error(centurion);
        }
    }
}

fn probe_mtime(graph: &mut Graph, n: Handle) {
    let name = graph.node(n).name.clone();
    let mtime = std::fs::metadata(&name).and_then(|m| m.modified()).ok();
    graph.node_mut(n).mtime = mtime;
}

/// A short best-effort trace back from `start` through `children`, used only
/// to render a cycle report; any repeated node closes the loop.
fn find_cycle(graph: &Graph, start: Handle) -> Vec<String> {
    let mut path = vec![start];
    let mut seen: HashSet<Handle> = HashSet::from([start]);
    let mut cur = start;
    loop {
        let next = graph.node(cur).children.iter().copied().find(|c| *c == start || !seen.contains(c));
        match next {
            Some(n) if n == start => break,
            Some(n) => {
                path.push(n);
                seen.insert(n);
                cur = n;
            }
            None => break,
        }
    }
    path.iter().map(|h| graph.node(*h).name.clone()).collect()
}
