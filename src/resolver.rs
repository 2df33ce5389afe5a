// src/resolver.rs

//! Dependency resolver
//!
//! Turns a set of goals plus the current installed-set and the
//! repository indexes into an ordered, conflict-free [`Plan`], or a
//! structured [`ResolutionError`] naming the exact unmet requirement.
//!
//! The resolver is pure: it performs no I/O, and identical inputs
//! produce identical plans. Candidate preference is highest repository
//! priority first, then highest version; the search backtracks
//! chronologically to the most recent assignment with remaining
//! candidates. Installing a name that is already installed replaces
//! the old version in place; the engine derives the file-level delta.

use crate::error::{ConflictKind, Error, Result};
use crate::manifest::{Arch, Manifest, PackageId, Relation};
use crate::repository::{Candidate, RepoSet};
use crate::state::records::InstalledRecord;
use crate::version::{Constraint, Op, Version};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

/// A requested change, one per CLI target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Goal {
    Install {
        name: String,
        constraint: Option<Constraint>,
    },
    Remove {
        name: String,
    },
    Upgrade {
        name: String,
    },
    /// Pin a package at its installed version
    Hold {
        name: String,
    },
}

/// One step of a plan, applied in order
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    FetchAndInstall {
        manifest: Manifest,
        repo_id: String,
        /// Requested by the user rather than pulled in as a dependency
        explicit: bool,
    },
    Remove {
        id: PackageId,
    },
    /// Deferred configure pass, emitted for dependency cycles so the
    /// unpack order can break them
    Reconfigure {
        id: PackageId,
    },
}

/// Ordered list of steps that transitions the installed-set to one
/// satisfying all goals and invariants
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn installs(&self) -> impl Iterator<Item = &Manifest> {
        self.steps.iter().filter_map(|s| match s {
            Step::FetchAndInstall { manifest, .. } => Some(manifest),
            _ => None,
        })
    }

    pub fn removals(&self) -> impl Iterator<Item = &PackageId> {
        self.steps.iter().filter_map(|s| match s {
            Step::Remove { id } => Some(id),
            _ => None,
        })
    }
}

/// Why resolution failed, with the specific unmet requirement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("No candidate of {name} satisfies {requirement}{}", needed_by.as_ref().map(|n| format!(" (needed by {n})")).unwrap_or_default())]
    NoCandidateSatisfies {
        name: String,
        requirement: String,
        needed_by: Option<String>,
    },

    #[error("{package} conflicts with installed {installed}")]
    ConflictsWithInstalled { package: String, installed: String },

    #[error("would break {dependent}: requires {requirement}")]
    WouldBreak {
        dependent: String,
        requirement: String,
    },

    #[error("all candidates for {0} come from untrusted repositories")]
    UntrustedRepository(String),

    #[error("{requirement} is provided by several packages ({providers}); install one explicitly", providers = providers.join(", "))]
    AmbiguousProvides {
        requirement: String,
        providers: Vec<String>,
    },
}

/// Policy knobs the resolver filters candidates by
#[derive(Debug, Clone)]
pub struct Policy {
    pub target_arch: Arch,
    pub require_trusted_repos: bool,
}

type ResolveResult<T> = std::result::Result<T, ResolutionError>;

/// Produce a plan for `goals` against `installed` and `repos`
pub fn resolve(
    goals: &[Goal],
    installed: &[InstalledRecord],
    repos: &RepoSet,
    policy: &Policy,
) -> Result<Plan> {
    let mut removed: BTreeSet<String> = BTreeSet::new();
    let mut holds: BTreeMap<String, Version> = BTreeMap::new();
    let mut queue: VecDeque<Requirement> = VecDeque::new();

    // Goal seeding.
    for goal in goals {
        match goal {
            Goal::Remove { name } => {
                if !installed.iter().any(|r| r.manifest.name == *name) {
                    return Err(ResolutionError::UnknownPackage(name.clone()).into());
                }
                removed.insert(name.clone());
            }
            Goal::Hold { name } => {
                let record = installed
                    .iter()
                    .find(|r| r.manifest.name == *name)
                    .ok_or_else(|| ResolutionError::UnknownPackage(name.clone()))?;
                holds.insert(name.clone(), record.manifest.version.clone());
            }
            _ => {}
        }
    }

    for goal in goals {
        match goal {
            Goal::Install { name, constraint } => {
                queue.push_back(Requirement {
                    name: name.clone(),
                    constraint: constraint.clone(),
                    needed_by: None,
                    explicit: true,
                });
            }
            Goal::Upgrade { name } => {
                let record = installed
                    .iter()
                    .find(|r| r.manifest.name == *name)
                    .ok_or_else(|| ResolutionError::UnknownPackage(name.clone()))?;
                if holds.contains_key(name) {
                    continue;
                }
                let Some(best) = repos.candidate(name, None, policy.target_arch) else {
                    continue;
                };
                if policy.require_trusted_repos && !best.trusted {
                    return Err(ResolutionError::UntrustedRepository(name.clone()).into());
                }
                if best.manifest.version > record.manifest.version {
                    debug!(
                        "Upgrade {name}: {} -> {}",
                        record.manifest.version, best.manifest.version
                    );
                    queue.push_back(Requirement {
                        name: name.clone(),
                        constraint: Some(Constraint::new(Op::Ge, best.manifest.version.clone())),
                        needed_by: None,
                        explicit: record.explicit,
                    });
                }
            }
            _ => {}
        }
    }

    let ctx = SearchCtx {
        repos,
        policy,
        installed,
        holds: &holds,
    };
    let state = SearchState {
        assignments: Vec::new(),
        removed,
    };
    let state = search(&ctx, state, queue).map_err(Error::Resolution)?;

    check_final_set(&ctx, &state)?;
    Ok(synthesize(&ctx, state))
}

/// One open `(name, constraint)` requirement
#[derive(Debug, Clone)]
struct Requirement {
    name: String,
    constraint: Option<Constraint>,
    needed_by: Option<String>,
    explicit: bool,
}

impl Requirement {
    fn describe(&self) -> String {
        match &self.constraint {
            Some(c) => format!("{} {c}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Clone)]
struct Assignment<'a> {
    manifest: &'a Manifest,
    repo_id: &'a str,
    explicit: bool,
}

struct SearchCtx<'a> {
    repos: &'a RepoSet,
    policy: &'a Policy,
    installed: &'a [InstalledRecord],
    holds: &'a BTreeMap<String, Version>,
}

#[derive(Clone)]
struct SearchState<'a> {
    assignments: Vec<Assignment<'a>>,
    /// Names leaving the installed-set: goal removals plus packages
    /// displaced via `replaces`
    removed: BTreeSet<String>,
}

impl<'a> SearchState<'a> {
    fn assigned(&self, name: &str) -> Option<&Assignment<'a>> {
        self.assignments.iter().find(|a| a.manifest.name == name)
    }
}

impl SearchCtx<'_> {
    /// Installed records that remain in the final set under `state`
    fn kept<'s>(&'s self, state: &'s SearchState<'_>) -> impl Iterator<Item = &'s InstalledRecord> {
        self.installed.iter().filter(move |r| {
            !state.removed.contains(&r.manifest.name) && state.assigned(&r.manifest.name).is_none()
        })
    }
}

/// Satisfy every queued requirement, backtracking over candidate
/// choices. Chronological backtracking: on failure the most recently
/// assigned variable with remaining candidates is retried first.
fn search<'a>(
    ctx: &SearchCtx<'a>,
    state: SearchState<'a>,
    mut queue: VecDeque<Requirement>,
) -> ResolveResult<SearchState<'a>> {
    let Some(req) = queue.pop_front() else {
        return Ok(state);
    };

    // Already satisfied by an assignment?
    if state
        .assignments
        .iter()
        .any(|a| manifest_satisfies(a.manifest, &req))
    {
        let mut state = state;
        if req.explicit {
            promote_explicit(&mut state, &req.name);
        }
        return search(ctx, state, queue);
    }

    // A different version of this name was already selected and does
    // not satisfy the new bound: dead branch, backtrack.
    if let Some(existing) = state.assigned(&req.name) {
        return Err(ResolutionError::NoCandidateSatisfies {
            name: req.name.clone(),
            requirement: format!(
                "{} (already selected {})",
                req.describe(),
                existing.manifest.version
            ),
            needed_by: req.needed_by.clone(),
        });
    }

    // Satisfied by a kept installed package? (Idempotent installs land
    // here: install of the installed version is a no-op.)
    let relation = relation_of(&req);
    if ctx.kept(&state).any(|r| r.satisfies(&relation)) {
        return search(ctx, state, queue);
    }

    trace!("Open requirement: {}", req.describe());
    let candidates = eligible_candidates(ctx, &req)?;

    let mut last_error: Option<ResolutionError> = None;
    for candidate in candidates {
        let mut next = state.clone();
        if let Err(e) = assign(ctx, &mut next, &candidate, &req) {
            last_error = Some(e);
            continue;
        }

        let mut next_queue = queue.clone();
        for dep in &candidate.manifest.depends {
            next_queue.push_back(Requirement {
                name: dep.name.clone(),
                constraint: dep.constraint.clone(),
                needed_by: Some(candidate.manifest.id().to_string()),
                explicit: false,
            });
        }

        match search(ctx, next, next_queue) {
            Ok(done) => return Ok(done),
            Err(e) => {
                trace!(
                    "Candidate {} for {} failed: {e}",
                    candidate.manifest.id(),
                    req.describe()
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ResolutionError::NoCandidateSatisfies {
        name: req.name.clone(),
        requirement: req.describe(),
        needed_by: req.needed_by.clone(),
    }))
}

fn relation_of(req: &Requirement) -> Relation {
    Relation::new(req.name.clone(), req.constraint.clone())
}

fn manifest_satisfies(manifest: &Manifest, req: &Requirement) -> bool {
    if manifest.name == req.name {
        return req
            .constraint
            .as_ref()
            .map_or(true, |c| c.matches(&manifest.version));
    }
    manifest.provides.iter().any(|p| {
        p.name == req.name
            && match (&req.constraint, &p.constraint) {
                (None, _) => true,
                (Some(want), Some(provided)) => {
                    provided.op == Op::Eq && want.matches(&provided.version)
                }
                (Some(_), None) => false,
            }
    })
}

fn promote_explicit(state: &mut SearchState<'_>, name: &str) {
    if let Some(a) = state.assignments.iter_mut().find(|a| a.manifest.name == name) {
        a.explicit = true;
    }
}

/// Candidate set for a requirement, in deterministic preference order,
/// with policy filtering and the structured errors for an empty result
fn eligible_candidates<'a>(
    ctx: &SearchCtx<'a>,
    req: &Requirement,
) -> ResolveResult<Vec<Candidate<'a>>> {
    let all = ctx.repos.query(&req.name);
    if all.is_empty() {
        return Err(ResolutionError::UnknownPackage(req.name.clone()));
    }

    let mut matching = ctx
        .repos
        .candidates(&req.name, req.constraint.as_ref(), ctx.policy.target_arch);

    // Virtual requirement with several distinct providers and no exact
    // name match is ambiguous; the user must pick one.
    if !matching.iter().any(|c| c.manifest.name == req.name) {
        let providers: BTreeSet<&str> =
            matching.iter().map(|c| c.manifest.name.as_str()).collect();
        if providers.len() > 1 {
            return Err(ResolutionError::AmbiguousProvides {
                requirement: req.describe(),
                providers: providers.iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    if matching.is_empty() {
        return Err(ResolutionError::NoCandidateSatisfies {
            name: req.name.clone(),
            requirement: req.describe(),
            needed_by: req.needed_by.clone(),
        });
    }

    if ctx.policy.require_trusted_repos {
        matching.retain(|c| c.trusted);
        if matching.is_empty() {
            return Err(ResolutionError::UntrustedRepository(req.name.clone()));
        }
    }

    // A held package only accepts its pinned version.
    if let Some(pinned) = ctx.holds.get(&req.name) {
        matching.retain(|c| &c.manifest.version == pinned);
        if matching.is_empty() {
            return Err(ResolutionError::NoCandidateSatisfies {
                name: req.name.clone(),
                requirement: format!("{} (held at {pinned})", req.describe()),
                needed_by: req.needed_by.clone(),
            });
        }
    }

    Ok(matching)
}

/// Tentatively add `candidate` to the state, propagating its
/// `conflicts` and `replaces` against the rest of the set
fn assign<'a>(
    ctx: &SearchCtx<'a>,
    state: &mut SearchState<'a>,
    candidate: &Candidate<'a>,
    req: &Requirement,
) -> ResolveResult<()> {
    let manifest = candidate.manifest;

    // `replaces` displaces matching installed packages.
    for replaces in &manifest.replaces {
        for record in ctx.installed {
            if record.manifest.name != manifest.name
                && replaces.satisfied_by(&record.manifest.name, &record.manifest.version)
            {
                debug!("{} replaces installed {}", manifest.id(), record.id());
                state.removed.insert(record.manifest.name.clone());
            }
        }
    }

    // Symmetric conflict check against kept installed packages. The
    // same-name record is the version being replaced, not a peer.
    for record in ctx.kept(state) {
        if record.manifest.name == manifest.name {
            continue;
        }
        let clash = manifest.conflicts_with(&record.manifest.name, &record.manifest.version)
            || record
                .manifest
                .conflicts_with(&manifest.name, &manifest.version);
        if clash {
            return Err(ResolutionError::ConflictsWithInstalled {
                package: manifest.id().to_string(),
                installed: record.id().to_string(),
            });
        }
    }

    // And against other tentative assignments.
    for other in &state.assignments {
        let clash = manifest.conflicts_with(&other.manifest.name, &other.manifest.version)
            || other
                .manifest
                .conflicts_with(&manifest.name, &manifest.version);
        if clash {
            return Err(ResolutionError::ConflictsWithInstalled {
                package: manifest.id().to_string(),
                installed: other.manifest.id().to_string(),
            });
        }
    }

    // Kept dependents of this name must still be satisfied by the new
    // version (unless they are leaving the set too).
    for record in ctx.kept(state) {
        for dep in &record.manifest.depends {
            if dep.name == manifest.name
                && !dep
                    .constraint
                    .as_ref()
                    .map_or(true, |c| c.matches(&manifest.version))
            {
                return Err(ResolutionError::WouldBreak {
                    dependent: record.id().to_string(),
                    requirement: dep.to_string(),
                });
            }
        }
    }

    state.assignments.push(Assignment {
        manifest,
        repo_id: candidate.repo_id,
        explicit: req.explicit && req.needed_by.is_none(),
    });
    Ok(())
}

/// Reverify the complete final assignment: dependency closure of the
/// kept set, symmetric conflicts, and file-path disjointness over the
/// manifests' file lists.
fn check_final_set(ctx: &SearchCtx<'_>, state: &SearchState<'_>) -> Result<()> {
    struct Member<'b> {
        manifest: &'b Manifest,
        files_shared: Vec<(&'b str, bool)>,
    }

    let mut members: Vec<Member<'_>> = Vec::new();
    for record in ctx.kept(state) {
        members.push(Member {
            manifest: &record.manifest,
            files_shared: record
                .files
                .iter()
                .map(|f| (f.path.as_str(), f.shared))
                .collect(),
        });
    }
    for assignment in &state.assignments {
        members.push(Member {
            manifest: assignment.manifest,
            files_shared: assignment
                .manifest
                .files
                .iter()
                .map(|f| (f.path.as_str(), f.shared))
                .collect(),
        });
    }

    // Orphan detection: every dependency of every remaining package
    // must still be satisfied after the removals.
    for member in &members {
        for dep in &member.manifest.depends {
            let satisfied = members.iter().any(|m| {
                m.manifest.name == dep.name
                    && dep
                        .constraint
                        .as_ref()
                        .map_or(true, |c| c.matches(&m.manifest.version))
                    || m.manifest.provides.iter().any(|p| {
                        p.name == dep.name
                            && match (&dep.constraint, &p.constraint) {
                                (None, _) => true,
                                (Some(want), Some(provided)) => {
                                    provided.op == Op::Eq && want.matches(&provided.version)
                                }
                                (Some(_), None) => false,
                            }
                    })
            });
            if !satisfied {
                return Err(ResolutionError::WouldBreak {
                    dependent: member.manifest.id().to_string(),
                    requirement: dep.to_string(),
                }
                .into());
            }
        }
    }

    for a in &members {
        for b in &members {
            if a.manifest.name != b.manifest.name
                && a.manifest
                    .conflicts_with(&b.manifest.name, &b.manifest.version)
            {
                return Err(ResolutionError::ConflictsWithInstalled {
                    package: a.manifest.id().to_string(),
                    installed: b.manifest.id().to_string(),
                }
                .into());
            }
        }
    }

    // Staging re-checks the same property against the extracted trees;
    // catching it here keeps the live prefix untouched.
    let mut owners: BTreeMap<&str, (&str, bool)> = BTreeMap::new();
    for member in &members {
        for (path, shared) in &member.files_shared {
            if let Some((owner, owner_shared)) = owners.get(path) {
                if !(*shared && *owner_shared) {
                    return Err(Error::Conflict(ConflictKind::FileCollision {
                        path: path.to_string(),
                        first: owner.to_string(),
                        second: member.manifest.id().to_string(),
                    }));
                }
            } else {
                owners.insert(*path, (member.manifest.name.as_str(), *shared));
            }
        }
    }

    Ok(())
}

/// Order the final assignment into steps: removals dependents-first,
/// installs dependencies-first, deferred configures for cycle members.
fn synthesize(ctx: &SearchCtx<'_>, state: SearchState<'_>) -> Plan {
    let mut steps = Vec::new();

    // Removals. A package must be removed before anything it depends
    // on, so dependents drain first.
    let removal_records: Vec<&InstalledRecord> = ctx
        .installed
        .iter()
        .filter(|r| state.removed.contains(&r.manifest.name))
        .collect();
    for record in order_removals(&removal_records) {
        steps.push(Step::Remove { id: record.id() });
    }

    // Installs, dependencies first; cycle members fall out in name
    // order and get a deferred configure pass.
    let (ordered, cycle_members) = order_installs(&state.assignments);
    for assignment in &ordered {
        steps.push(Step::FetchAndInstall {
            manifest: assignment.manifest.clone(),
            repo_id: assignment.repo_id.to_string(),
            explicit: assignment.explicit,
        });
    }
    for name in &cycle_members {
        if let Some(assignment) = state.assigned(name) {
            steps.push(Step::Reconfigure {
                id: assignment.manifest.id(),
            });
        }
    }

    Plan { steps }
}

fn order_removals<'b>(records: &[&'b InstalledRecord]) -> Vec<&'b InstalledRecord> {
    // Edge r -> s when r depends on s; drain nodes with no incoming
    // dependents first.
    let mut remaining: BTreeMap<&str, &InstalledRecord> = records
        .iter()
        .map(|r| (r.manifest.name.as_str(), *r))
        .collect();
    let mut out = Vec::new();

    while !remaining.is_empty() {
        let next = remaining
            .iter()
            .find(|(name, _)| {
                // No other remaining package depends on this one.
                !remaining.values().any(|other| {
                    other.manifest.name.as_str() != **name
                        && other.manifest.depends.iter().any(|d| d.name == **name)
                })
            })
            .map(|(name, _)| *name)
            // Removal cycle: deterministic fallback to name order.
            .unwrap_or_else(|| *remaining.keys().next().expect("remaining is non-empty"));
        out.push(remaining.remove(next).expect("name came from the map"));
    }
    out
}

fn order_installs<'b, 'a>(
    assignments: &'b [Assignment<'a>],
) -> (Vec<&'b Assignment<'a>>, Vec<String>) {
    let by_name: BTreeMap<String, &'b Assignment<'a>> = assignments
        .iter()
        .map(|a| (a.manifest.name.clone(), a))
        .collect();

    // Kahn's algorithm over intra-plan dependency edges, including
    // edges through provides.
    let provider_of = |dep: &Relation| -> Option<String> {
        if by_name.contains_key(&dep.name) {
            return Some(dep.name.clone());
        }
        by_name
            .values()
            .find(|a| a.manifest.provides.iter().any(|p| p.name == dep.name))
            .map(|a| a.manifest.name.clone())
    };

    let mut deps_of: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, assignment) in &by_name {
        let mut edges = BTreeSet::new();
        for dep in &assignment.manifest.depends {
            if let Some(provider) = provider_of(dep) {
                if &provider != name {
                    edges.insert(provider);
                }
            }
        }
        deps_of.insert(name.clone(), edges);
    }

    let mut ordered = Vec::new();
    let mut placed: BTreeSet<String> = BTreeSet::new();
    loop {
        let ready: Vec<String> = deps_of
            .iter()
            .filter(|(name, deps)| !placed.contains(*name) && deps.is_subset(&placed))
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        for name in ready {
            ordered.push(by_name[&name]);
            placed.insert(name);
        }
    }

    // Whatever is left participates in a cycle. Legal when mediated by
    // configure-time relationships: unpack in name order, configure
    // later.
    let cycle_members: Vec<String> = deps_of
        .keys()
        .filter(|name| !placed.contains(*name))
        .cloned()
        .collect();
    for name in &cycle_members {
        ordered.push(by_name[name]);
    }

    (ordered, cycle_members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::manifest::{Codec, FileEntry, FileKind, Scripts};
    use crate::repository::IndexSnapshot;
    use tempfile::{tempdir, TempDir};

    fn manifest(name: &str, version: &str) -> Manifest {
        Manifest {
            name: name.to_string(),
            version: version.parse().unwrap(),
            arch: Arch::Any,
            description: String::new(),
            license: String::new(),
            maintainer: String::new(),
            download_size: 1,
            installed_size: 1,
            codec: Codec::Gzip,
            download_checksum: "00".repeat(32),
            files: Vec::new(),
            depends: Vec::new(),
            recommends: Vec::new(),
            conflicts: Vec::new(),
            replaces: Vec::new(),
            provides: Vec::new(),
            scripts: Scripts::default(),
            signature: None,
        }
    }

    fn with_file(mut m: Manifest, path: &str, shared: bool) -> Manifest {
        m.files.push(FileEntry {
            path: path.to_string(),
            mode: 0o755,
            owner: "root".to_string(),
            sha256: "11".repeat(32),
            kind: FileKind::Regular,
            shared,
        });
        m
    }

    fn installed(manifest: Manifest, explicit: bool) -> InstalledRecord {
        let files = manifest.files.clone();
        InstalledRecord {
            manifest,
            installed_at: "2026-01-01T00:00:00Z".to_string(),
            explicit,
            files,
        }
    }

    /// Build a RepoSet from in-memory manifests by writing index
    /// snapshots directly; no signing, no network.
    fn repo_set(state: &TempDir, repos: &[(&str, i32, bool, &[Manifest])]) -> RepoSet {
        let mut config_text = String::from("[security]\nrequire_signatures = false\n\n");
        for (id, priority, trusted, _) in repos {
            config_text.push_str(&format!(
                "[repository.{id}]\nurl = \"file:///unused/{id}\"\npriority = {priority}\ntrusted = {trusted}\n\n"
            ));
        }
        let config = Config::from_toml(&config_text).unwrap();

        let indexes = state.path().join("indexes");
        std::fs::create_dir_all(&indexes).unwrap();
        for (id, _, _, manifests) in repos {
            let snapshot = IndexSnapshot {
                repo_id: id.to_string(),
                fetched_at: chrono::Utc::now().to_rfc3339(),
                public_key: String::new(),
                manifests: manifests.to_vec(),
            };
            std::fs::write(
                indexes.join(format!("{id}.idx")),
                serde_json::to_vec(&snapshot).unwrap(),
            )
            .unwrap();
        }
        RepoSet::load(state.path(), &config).unwrap()
    }

    fn policy() -> Policy {
        Policy {
            target_arch: Arch::X86_64,
            require_trusted_repos: false,
        }
    }

    fn install_goal(name: &str) -> Goal {
        Goal::Install {
            name: name.to_string(),
            constraint: None,
        }
    }

    fn install_names(plan: &Plan) -> Vec<&str> {
        plan.installs().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn test_single_package_no_deps() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[manifest("hello", "1.0.0")])]);

        let plan = resolve(&[install_goal("hello")], &[], &repos, &policy()).unwrap();
        assert_eq!(plan.steps.len(), 1);
        match &plan.steps[0] {
            Step::FetchAndInstall { manifest, explicit, .. } => {
                assert_eq!(manifest.name, "hello");
                assert!(*explicit);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_transitive_dependency_ordering() {
        let state = tempdir().unwrap();
        let mut app = manifest("app", "2.0.0");
        app.depends.push("lib >= 1.0".parse().unwrap());
        let repos = repo_set(
            &state,
            &[("main", 500, true, &[app, manifest("lib", "1.2.0")])],
        );

        let plan = resolve(&[install_goal("app")], &[], &repos, &policy()).unwrap();
        assert_eq!(install_names(&plan), vec!["lib", "app"]);

        // Dependency is non-explicit, the requested package explicit.
        let flags: Vec<bool> = plan
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::FetchAndInstall { explicit, .. } => Some(*explicit),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_install_installed_version_is_noop() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[manifest("hello", "1.0.0")])]);
        let current = [installed(manifest("hello", "1.0.0"), true)];

        let plan = resolve(&[install_goal("hello")], &current, &repos, &policy()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_unknown_package() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[])]);
        let err = resolve(&[install_goal("ghost")], &[], &repos, &policy());
        assert!(matches!(
            err,
            Err(Error::Resolution(ResolutionError::UnknownPackage(name))) if name == "ghost"
        ));
    }

    #[test]
    fn test_no_candidate_satisfies() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[manifest("hello", "1.0.0")])]);
        let goal = Goal::Install {
            name: "hello".to_string(),
            constraint: Some(">= 2.0".parse().unwrap()),
        };
        let err = resolve(&[goal], &[], &repos, &policy());
        assert!(matches!(
            err,
            Err(Error::Resolution(ResolutionError::NoCandidateSatisfies { .. }))
        ));
    }

    #[test]
    fn test_priority_beats_version() {
        let state = tempdir().unwrap();
        let repos = repo_set(
            &state,
            &[
                ("main", 500, true, &[manifest("openssl", "3.0.9")]),
                ("security", 900, true, &[manifest("openssl", "3.0.7")]),
            ],
        );
        let plan = resolve(&[install_goal("openssl")], &[], &repos, &policy()).unwrap();
        match &plan.steps[0] {
            Step::FetchAndInstall { manifest, repo_id, .. } => {
                assert_eq!(repo_id, "security");
                assert_eq!(manifest.version, "3.0.7".parse().unwrap());
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_prefers_higher_priority_repo() {
        let state = tempdir().unwrap();
        let repos = repo_set(
            &state,
            &[
                ("main", 500, true, &[manifest("openssl", "3.0.5")]),
                ("security", 900, true, &[manifest("openssl", "3.0.7")]),
            ],
        );
        let current = [installed(manifest("openssl", "3.0.5"), true)];
        let plan = resolve(
            &[Goal::Upgrade { name: "openssl".to_string() }],
            &current,
            &repos,
            &policy(),
        )
        .unwrap();
        match &plan.steps[0] {
            Step::FetchAndInstall { manifest, repo_id, .. } => {
                assert_eq!(repo_id, "security");
                assert_eq!(manifest.version, "3.0.7".parse().unwrap());
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_upgrade_at_latest_is_noop() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[manifest("hello", "1.0.0")])]);
        let current = [installed(manifest("hello", "1.0.0"), true)];
        let plan = resolve(
            &[Goal::Upgrade { name: "hello".to_string() }],
            &current,
            &repos,
            &policy(),
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_hold_pins_version() {
        let state = tempdir().unwrap();
        let repos = repo_set(
            &state,
            &[("main", 500, true, &[manifest("hello", "1.0.0"), manifest("hello", "2.0.0")])],
        );
        let current = [installed(manifest("hello", "1.0.0"), true)];
        let plan = resolve(
            &[
                Goal::Hold { name: "hello".to_string() },
                Goal::Upgrade { name: "hello".to_string() },
            ],
            &current,
            &repos,
            &policy(),
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_conflict_with_installed() {
        let state = tempdir().unwrap();
        let mut b = manifest("pkg-b", "1.0");
        b.conflicts.push("pkg-a".parse().unwrap());
        let repos = repo_set(&state, &[("main", 500, true, &[b])]);
        let current = [installed(manifest("pkg-a", "1.0"), true)];

        let err = resolve(&[install_goal("pkg-b")], &current, &repos, &policy());
        assert!(matches!(
            err,
            Err(Error::Resolution(ResolutionError::ConflictsWithInstalled { .. }))
        ));
    }

    #[test]
    fn test_file_collision_detected_before_any_mutation() {
        let state = tempdir().unwrap();
        let b = with_file(manifest("pkg-b", "1.0"), "usr/bin/foo", false);
        let repos = repo_set(&state, &[("main", 500, true, &[b])]);
        let current = [installed(
            with_file(manifest("pkg-a", "1.0"), "usr/bin/foo", false),
            true,
        )];

        let err = resolve(&[install_goal("pkg-b")], &current, &repos, &policy());
        assert!(matches!(
            err,
            Err(Error::Conflict(ConflictKind::FileCollision { .. }))
        ));
    }

    #[test]
    fn test_shared_file_on_both_sides_resolves() {
        let state = tempdir().unwrap();
        let b = with_file(manifest("pkg-b", "1.0"), "usr/share/locale.db", true);
        let repos = repo_set(&state, &[("main", 500, true, &[b])]);
        let current = [installed(
            with_file(manifest("pkg-a", "1.0"), "usr/share/locale.db", true),
            true,
        )];
        let plan = resolve(&[install_goal("pkg-b")], &current, &repos, &policy()).unwrap();
        assert_eq!(install_names(&plan), vec!["pkg-b"]);
    }

    #[test]
    fn test_remove_breaking_dependent_fails() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[])]);
        let mut app = manifest("app", "1.0");
        app.depends.push("lib".parse().unwrap());
        let current = [
            installed(manifest("lib", "1.0"), false),
            installed(app, true),
        ];

        let err = resolve(
            &[Goal::Remove { name: "lib".to_string() }],
            &current,
            &repos,
            &policy(),
        );
        assert!(matches!(
            err,
            Err(Error::Resolution(ResolutionError::WouldBreak { .. }))
        ));
    }

    #[test]
    fn test_remove_leaf_package() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[])]);
        let current = [installed(manifest("hello", "1.0"), true)];
        let plan = resolve(
            &[Goal::Remove { name: "hello".to_string() }],
            &current,
            &repos,
            &policy(),
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(&plan.steps[0], Step::Remove { id } if id.name == "hello"));
    }

    #[test]
    fn test_removals_ordered_dependents_first() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("main", 500, true, &[])]);
        let mut app = manifest("app", "1.0");
        app.depends.push("lib".parse().unwrap());
        let current = [
            installed(manifest("lib", "1.0"), false),
            installed(app, true),
        ];
        let plan = resolve(
            &[
                Goal::Remove { name: "app".to_string() },
                Goal::Remove { name: "lib".to_string() },
            ],
            &current,
            &repos,
            &policy(),
        )
        .unwrap();
        let removals: Vec<&str> = plan.removals().map(|id| id.name.as_str()).collect();
        assert_eq!(removals, vec!["app", "lib"]);
    }

    #[test]
    fn test_untrusted_repo_rejected_by_policy() {
        let state = tempdir().unwrap();
        let repos = repo_set(&state, &[("shady", 500, false, &[manifest("hello", "1.0")])]);
        let mut strict = policy();
        strict.require_trusted_repos = true;

        let err = resolve(&[install_goal("hello")], &[], &repos, &strict);
        assert!(matches!(
            err,
            Err(Error::Resolution(ResolutionError::UntrustedRepository(_)))
        ));
    }

    #[test]
    fn test_virtual_requirement_single_provider() {
        let state = tempdir().unwrap();
        let mut postfix = manifest("postfix", "3.8.0");
        postfix.provides.push(Relation::new("mail-transport", None));
        let mut cron = manifest("cron", "1.0");
        cron.depends.push("mail-transport".parse().unwrap());
        let repos = repo_set(&state, &[("main", 500, true, &[postfix, cron])]);

        let plan = resolve(&[install_goal("cron")], &[], &repos, &policy()).unwrap();
        assert_eq!(install_names(&plan), vec!["postfix", "cron"]);
    }

    #[test]
    fn test_ambiguous_provides() {
        let state = tempdir().unwrap();
        let mut postfix = manifest("postfix", "3.8.0");
        postfix.provides.push(Relation::new("mail-transport", None));
        let mut exim = manifest("exim", "4.97");
        exim.provides.push(Relation::new("mail-transport", None));
        let repos = repo_set(&state, &[("main", 500, true, &[postfix, exim])]);

        let err = resolve(&[install_goal("mail-transport")], &[], &repos, &policy());
        assert!(matches!(
            err,
            Err(Error::Resolution(ResolutionError::AmbiguousProvides { .. }))
        ));
    }

    #[test]
    fn test_backtracks_over_conflicting_candidate() {
        let state = tempdir().unwrap();
        // newer lib conflicts with installed base; older lib does not.
        let mut lib2 = manifest("lib", "2.0");
        lib2.conflicts.push("base".parse().unwrap());
        let lib1 = manifest("lib", "1.0");
        let mut app = manifest("app", "1.0");
        app.depends.push("lib".parse().unwrap());
        let repos = repo_set(&state, &[("main", 500, true, &[lib2, lib1, app])]);
        let current = [installed(manifest("base", "1.0"), true)];

        let plan = resolve(&[install_goal("app")], &current, &repos, &policy()).unwrap();
        let versions: Vec<String> = plan.installs().map(|m| m.version.to_string()).collect();
        assert!(versions.contains(&"1.0".to_string()));
        assert!(!versions.contains(&"2.0".to_string()));
    }

    #[test]
    fn test_dependency_cycle_gets_deferred_configure() {
        let state = tempdir().unwrap();
        let mut a = manifest("pkg-a", "1.0");
        a.depends.push("pkg-b".parse().unwrap());
        let mut b = manifest("pkg-b", "1.0");
        b.depends.push("pkg-a".parse().unwrap());
        let repos = repo_set(&state, &[("main", 500, true, &[a, b])]);

        let plan = resolve(&[install_goal("pkg-a")], &[], &repos, &policy()).unwrap();
        let installs = install_names(&plan);
        assert_eq!(installs.len(), 2);
        // Cycle members unpack in name order and configure afterwards.
        assert_eq!(installs, vec!["pkg-a", "pkg-b"]);
        let reconfigures: Vec<&str> = plan
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Reconfigure { id } => Some(id.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(reconfigures, vec!["pkg-a", "pkg-b"]);
    }

    #[test]
    fn test_replaces_displaces_installed() {
        let state = tempdir().unwrap();
        let mut newpkg = manifest("newssl", "1.0");
        newpkg.replaces.push("oldssl".parse().unwrap());
        newpkg.provides.push(Relation::new("oldssl", None));
        let repos = repo_set(&state, &[("main", 500, true, &[newpkg])]);
        let current = [installed(manifest("oldssl", "0.9"), true)];

        let plan = resolve(&[install_goal("newssl")], &current, &repos, &policy()).unwrap();
        let removals: Vec<&str> = plan.removals().map(|id| id.name.as_str()).collect();
        assert_eq!(removals, vec!["oldssl"]);
        assert_eq!(install_names(&plan), vec!["newssl"]);
    }

    #[test]
    fn test_plans_are_deterministic() {
        let state = tempdir().unwrap();
        let mut app = manifest("app", "1.0");
        app.depends.push("liba".parse().unwrap());
        app.depends.push("libb".parse().unwrap());
        let repos = repo_set(
            &state,
            &[(
                "main",
                500,
                true,
                &[app, manifest("liba", "1.0"), manifest("libb", "1.0")],
            )],
        );

        let first = resolve(&[install_goal("app")], &[], &repos, &policy()).unwrap();
        let second = resolve(&[install_goal("app")], &[], &repos, &policy()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_arch_incompatible_candidate_skipped() {
        let state = tempdir().unwrap();
        let mut foreign = manifest("tool", "2.0");
        foreign.arch = Arch::Aarch64;
        let native = manifest("tool", "1.0");
        let repos = repo_set(&state, &[("main", 500, true, &[foreign, native])]);

        let plan = resolve(&[install_goal("tool")], &[], &repos, &policy()).unwrap();
        let versions: Vec<String> = plan.installs().map(|m| m.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0"]);
    }
}
