use super::DeployRequest;
use crate::constants::{
    BUILD_MANIFESTS, IGNORED_ROOT_SEGMENTS, MAX_DEPLOY_CANDIDATES, MAX_PROJECT_NAME_LEN,
    MAX_ROOT_GUESSES, PREFERRED_APP_DIRS,
};
use crate::types::HostingProvider;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Repository file listing used to guess deploy roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoMetadata {
    pub paths: Vec<String>,
}

/// A directory that looks buildable, with the manifests found in it.
/// `dir` is empty for the repository root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootGuess {
    pub dir: String,
    pub manifests: BTreeSet<String>,
}

impl RootGuess {
    fn has(&self, manifest: &str) -> bool {
        self.manifests.contains(manifest)
    }

    fn display(&self) -> &str {
        if self.dir.is_empty() {
            "."
        } else {
            &self.dir
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployStrategyCandidate {
    pub label: String,
    pub project_name: String,
    pub root_directory: Option<String>,
    /// Provider request body for starting the deployment.
    pub body: Value,
}

fn is_ignored(dir: &str) -> bool {
    dir.split('/')
        .any(|seg| seg.starts_with('.') || IGNORED_ROOT_SEGMENTS.contains(&seg))
}

fn root_rank(dir: &str) -> (usize, usize, usize) {
    if dir.is_empty() {
        return (0, 0, 0);
    }
    let preferred = PREFERRED_APP_DIRS
        .iter()
        .position(|p| *p == dir)
        .unwrap_or(PREFERRED_APP_DIRS.len());
    (1, preferred, dir.matches('/').count())
}

/// Repository root first, then conventional app folders, then shallower paths.
pub fn guess_root_dirs(paths: &[String]) -> Vec<RootGuess> {
    let mut found: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    found.entry(String::new()).or_default();

    for path in paths {
        let path = path.trim_start_matches("./");
        let (dir, file) = match path.rsplit_once('/') {
            Some((d, f)) => (d, f),
            None => ("", path),
        };
        if !BUILD_MANIFESTS.contains(&file) || is_ignored(dir) {
            continue;
        }
        found.entry(dir.to_string()).or_default().insert(file.to_string());
    }

    let mut guesses: Vec<RootGuess> = found
        .into_iter()
        .map(|(dir, manifests)| RootGuess { dir, manifests })
        .collect();
    // BTreeMap order already breaks ties alphabetically; the sort is stable.
    guesses.sort_by_key(|g| root_rank(&g.dir));
    guesses.truncate(MAX_ROOT_GUESSES);
    guesses
}

/// Lowercase `[a-z0-9-]`, no leading/trailing/double dashes, capped length.
pub fn sanitize_project_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    out.truncate(MAX_PROJECT_NAME_LEN);
    out.trim_end_matches('-').to_string()
}

const DEFAULT_BRANCHES: &[&str] = &["main", "master"];

/// The requested name, then branch- and owner-qualified variants for name collisions.
/// Default branches get no branch variant.
pub fn project_name_variants(request: &DeployRequest) -> Vec<String> {
    let base = match sanitize_project_name(&request.project_name) {
        s if s.is_empty() => sanitize_project_name(&request.repo.name),
        s => s,
    };
    let base = if base.is_empty() {
        "app".to_string()
    } else {
        base
    };

    let mut raw = vec![base.clone()];
    let branch = sanitize_project_name(&request.branch);
    if !branch.is_empty() && !DEFAULT_BRANCHES.contains(&branch.as_str()) {
        raw.push(format!("{}-{}", base, branch));
    }
    raw.push(format!("{}-{}", request.repo.owner, base));

    let mut variants: Vec<String> = Vec::new();
    for name in raw.iter().map(|n| sanitize_project_name(n)) {
        if !name.is_empty() && !variants.contains(&name) {
            variants.push(name);
        }
    }
    variants
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderServiceKind {
    StaticSite,
    WebService,
}

impl RenderServiceKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::StaticSite => "static_site",
            Self::WebService => "web_service",
        }
    }
}

/// Static HTML only means a static site; a package.json beside index.html could
/// be either, so both are tried, static first.
fn render_kinds(root: &RootGuess) -> Vec<RenderServiceKind> {
    match (root.has("index.html"), root.has("package.json")) {
        (true, false) => vec![RenderServiceKind::StaticSite],
        (true, true) => vec![RenderServiceKind::StaticSite, RenderServiceKind::WebService],
        _ => vec![RenderServiceKind::WebService],
    }
}

fn vercel_body(request: &DeployRequest, root: &RootGuess, name: &str) -> Value {
    let root_directory = if root.dir.is_empty() {
        Value::Null
    } else {
        Value::String(root.dir.clone())
    };
    json!({
        "name": name,
        "gitSource": {
            "type": "github",
            "org": request.repo.owner,
            "repo": request.repo.name,
            "ref": request.branch,
        },
        "projectSettings": { "rootDirectory": root_directory },
        "target": "production",
    })
}

fn web_service_details(root: &RootGuess) -> Value {
    let (runtime, build, start) = if root.has("package.json") {
        ("node", "npm install && npm run build --if-present", "npm start")
    } else if root.has("requirements.txt") || root.has("pyproject.toml") {
        ("python", "pip install -r requirements.txt", "gunicorn app:app")
    } else if root.has("go.mod") {
        ("go", "go build -o app .", "./app")
    } else if root.has("Cargo.toml") {
        ("rust", "cargo build --release", "cargo run --release")
    } else if root.has("Gemfile") {
        ("ruby", "bundle install", "bundle exec rackup -p $PORT")
    } else {
        ("node", "npm install", "npm start")
    };
    json!({
        "runtime": runtime,
        "plan": "free",
        "envSpecificDetails": { "buildCommand": build, "startCommand": start },
    })
}

fn render_body(request: &DeployRequest, root: &RootGuess, name: &str, kind: RenderServiceKind) -> Value {
    let details = match kind {
        RenderServiceKind::StaticSite if root.has("package.json") => json!({
            "buildCommand": "npm install && npm run build",
            "publishPath": "dist",
        }),
        RenderServiceKind::StaticSite => json!({ "buildCommand": "", "publishPath": "." }),
        RenderServiceKind::WebService => web_service_details(root),
    };
    json!({
        "type": kind.as_str(),
        "name": name,
        "repo": format!("https://github.com/{}/{}", request.repo.owner, request.repo.name),
        "branch": request.branch,
        "rootDir": root.dir,
        "autoDeploy": "yes",
        "serviceDetails": details,
    })
}

/// Ordered deploy strategies: root guesses outermost, name variants inside,
/// and for Render the service kinds innermost. Never empty.
pub fn build_candidates(request: &DeployRequest, metadata: &RepoMetadata) -> Vec<DeployStrategyCandidate> {
    let roots = guess_root_dirs(&metadata.paths);
    let names = project_name_variants(request);
    let mut candidates = Vec::new();

    'outer: for root in &roots {
        for name in &names {
            let root_directory = if root.dir.is_empty() {
                None
            } else {
                Some(root.dir.clone())
            };
            let base_label = format!("root={} name={}", root.display(), name);
            match request.provider {
                HostingProvider::Vercel => candidates.push(DeployStrategyCandidate {
                    label: base_label,
                    project_name: name.clone(),
                    root_directory,
                    body: vercel_body(request, root, name),
                }),
                HostingProvider::Render => {
                    for kind in render_kinds(root) {
                        candidates.push(DeployStrategyCandidate {
                            label: format!("{} type={}", base_label, kind.as_str()),
                            project_name: name.clone(),
                            root_directory: root_directory.clone(),
                            body: render_body(request, root, name, kind),
                        });
                    }
                }
            }
            if candidates.len() >= MAX_DEPLOY_CANDIDATES {
                break 'outer;
            }
        }
    }
    candidates.truncate(MAX_DEPLOY_CANDIDATES);
    candidates
}
