//! Agent definition loader — discovers and parses `AGENT.md` profiles.
//!
//! Mirrors `SkillsLoader`'s discovery precedence and hand-rolled frontmatter
//! parser, but for named sub-agent profiles instead of skills.
//!
//! # AGENT.md format
//!
//! ```text
//! ---
//! name: researcher
//! description: "Digs through the web and the workspace for sources"
//! model: openai/gpt-4o
//! allowedTools: [read_file, web_search, web_fetch]
//! allowedSkills: none
//! ---
//!
//! # Researcher
//!
//! You are a research specialist. Cite your sources ...
//! ```
//!
//! A profile with no frontmatter (or a malformed one) resolves to an
//! all-defaults definition named after its directory: every safe tool
//! allowed, no skill restriction, no model override.

use std::path::{Path, PathBuf};

use tracing::debug;

// ─────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────

/// Where an agent profile was discovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentSource {
    /// User's workspace `agents/` directory.
    Workspace,
    /// Built-in with relaygate.
    Builtin,
}

/// Metadata about a discovered agent profile, without its body loaded.
#[derive(Clone, Debug)]
pub struct AgentInfo {
    pub name: String,
    pub path: PathBuf,
    pub source: AgentSource,
}

/// Scope of tools or skills an agent profile is allowed to use.
#[derive(Clone, Debug, PartialEq)]
pub enum AllowScope {
    /// No restriction beyond the sub-agent sandbox's own safe list.
    All,
    /// Nothing allowed.
    None,
    /// Exactly these names.
    Named(Vec<String>),
}

impl Default for AllowScope {
    fn default() -> Self {
        AllowScope::All
    }
}

/// A fully-parsed `AGENT.md` profile.
#[derive(Clone, Debug)]
pub struct AgentDefinition {
    pub name: String,
    pub description: Option<String>,
    /// Model override for tasks run under this profile (falls back to the
    /// caller's model, then the manager's default, if `None`).
    pub model: Option<String>,
    pub allowed_tools: AllowScope,
    pub allowed_skills: AllowScope,
    /// Markdown body (frontmatter stripped), folded into the sub-agent's
    /// system prompt.
    pub body: String,
    pub source: AgentSource,
}

// ─────────────────────────────────────────────
// AgentDefinitionLoader
// ─────────────────────────────────────────────

/// Discovers and loads `AGENT.md` profiles from workspace and built-in
/// directories, workspace taking precedence over built-in by name.
pub struct AgentDefinitionLoader {
    workspace_agents: PathBuf,
    builtin_agents: Option<PathBuf>,
}

impl AgentDefinitionLoader {
    /// `workspace` is the agent workspace root (contains an `agents/`
    /// subdirectory); `builtin_agents` is an optional bundled directory.
    pub fn new(workspace: &Path, builtin_agents: Option<PathBuf>) -> Self {
        Self {
            workspace_agents: workspace.join("agents"),
            builtin_agents,
        }
    }

    /// List all discovered agent profiles, workspace overriding built-in by name.
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents = Vec::new();

        if self.workspace_agents.is_dir() {
            scan_agent_dirs(&self.workspace_agents, AgentSource::Workspace, &mut agents);
        }

        if let Some(builtin) = &self.builtin_agents {
            if builtin.is_dir() {
                let existing: Vec<String> = agents.iter().map(|a| a.name.clone()).collect();
                let mut builtin_agents = Vec::new();
                scan_agent_dirs(builtin, AgentSource::Builtin, &mut builtin_agents);
                for agent in builtin_agents {
                    if !existing.contains(&agent.name) {
                        agents.push(agent);
                    }
                }
            }
        }

        agents
    }

    /// Load and parse a named profile. Looks in workspace first, then built-in.
    pub fn load_agent(&self, name: &str) -> Option<AgentDefinition> {
        let ws_path = self.workspace_agents.join(name).join("AGENT.md");
        if ws_path.is_file() {
            let content = std::fs::read_to_string(&ws_path).ok()?;
            return Some(parse_agent_definition(name, &content, AgentSource::Workspace));
        }

        if let Some(builtin) = &self.builtin_agents {
            let bi_path = builtin.join(name).join("AGENT.md");
            if bi_path.is_file() {
                let content = std::fs::read_to_string(&bi_path).ok()?;
                return Some(parse_agent_definition(name, &content, AgentSource::Builtin));
            }
        }

        None
    }
}

// ─────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────

fn scan_agent_dirs(dir: &Path, source: AgentSource, out: &mut Vec<AgentInfo>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let def_file = path.join("AGENT.md");
            if def_file.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    debug!(name, source = ?source, "discovered agent profile");
                    out.push(AgentInfo {
                        name: name.to_string(),
                        path: def_file,
                        source: source.clone(),
                    });
                }
            }
        }
    }
}

/// Parse an `AGENT.md` file's frontmatter + body into a definition.
///
/// A file with no `---`-delimited frontmatter resolves to an all-defaults
/// profile named `name`, with the whole file as the body.
fn parse_agent_definition(name: &str, content: &str, source: AgentSource) -> AgentDefinition {
    let frontmatter = parse_frontmatter(content);
    let body = strip_frontmatter(content).to_string();

    let fm = match frontmatter {
        Some(fm) => fm,
        None => {
            return AgentDefinition {
                name: name.to_string(),
                description: None,
                model: None,
                allowed_tools: AllowScope::All,
                allowed_skills: AllowScope::All,
                body,
                source,
            }
        }
    };

    let get = |key: &str| -> Option<String> {
        fm.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim_matches('"').trim_matches('\'').to_string())
    };

    let profile_name = get("name").unwrap_or_else(|| name.to_string());
    let description = get("description");
    let model = get("model").filter(|m| !m.is_empty());
    let allowed_tools = get("allowedTools")
        .map(|v| parse_scope(&v))
        .unwrap_or(AllowScope::All);
    let allowed_skills = get("allowedSkills")
        .map(|v| parse_scope(&v))
        .unwrap_or(AllowScope::All);

    AgentDefinition {
        name: profile_name,
        description,
        model,
        allowed_tools,
        allowed_skills,
        body,
        source,
    }
}

/// Parse an `allowedTools`/`allowedSkills` frontmatter value.
///
/// Accepts `all`, `none`, a bracketed list `[a, b, c]`, or a bare
/// comma-separated list `a, b, c`.
fn parse_scope(raw: &str) -> AllowScope {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "all" => return AllowScope::All,
        "none" => return AllowScope::None,
        _ => {}
    }

    let inner = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);

    let names: Vec<String> = inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if names.is_empty() {
        AllowScope::None
    } else {
        AllowScope::Named(names)
    }
}

/// Parse `---`-delimited frontmatter into ordered key/value pairs.
fn parse_frontmatter(content: &str) -> Option<Vec<(String, String)>> {
    if !content.starts_with("---") {
        return None;
    }

    let after_first = &content[3..];
    let end = after_first.find("\n---")?;
    let block = &after_first[..end];

    let mut pairs = Vec::new();
    for line in block.lines() {
        let line = line.trim();
        if let Some(idx) = line.find(':') {
            let key = line[..idx].trim().to_string();
            let value = line[idx + 1..].trim().to_string();
            if !key.is_empty() {
                pairs.push((key, value));
            }
        }
    }

    Some(pairs)
}

/// Strip frontmatter, returning the markdown body.
fn strip_frontmatter(content: &str) -> &str {
    if !content.starts_with("---") {
        return content;
    }
    let after_first = &content[3..];
    match after_first.find("\n---") {
        Some(end) => {
            let rest = &after_first[end + 4..];
            rest.trim_start_matches('\n')
        }
        None => content,
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn create_agent(base: &Path, name: &str, content: &str) {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("AGENT.md"), content).unwrap();
    }

    #[test]
    fn parse_scope_all_none_and_list() {
        assert_eq!(parse_scope("all"), AllowScope::All);
        assert_eq!(parse_scope("none"), AllowScope::None);
        assert_eq!(
            parse_scope("[read_file, web_search]"),
            AllowScope::Named(vec!["read_file".into(), "web_search".into()])
        );
        assert_eq!(
            parse_scope("read_file, web_search"),
            AllowScope::Named(vec!["read_file".into(), "web_search".into()])
        );
    }

    #[test]
    fn missing_frontmatter_yields_all_defaults() {
        let def = parse_agent_definition("generic", "# Just a prompt body", AgentSource::Workspace);
        assert_eq!(def.name, "generic");
        assert_eq!(def.allowed_tools, AllowScope::All);
        assert_eq!(def.allowed_skills, AllowScope::All);
        assert!(def.model.is_none());
        assert!(def.body.contains("Just a prompt body"));
    }

    #[test]
    fn full_frontmatter_parsed() {
        let content = "---\nname: researcher\ndescription: \"Digs through sources\"\nmodel: openai/gpt-4o\nallowedTools: [read_file, web_search, web_fetch]\nallowedSkills: none\n---\n\n# Researcher\n\nCite sources.";
        let def = parse_agent_definition("researcher", content, AgentSource::Workspace);
        assert_eq!(def.name, "researcher");
        assert_eq!(def.description.as_deref(), Some("Digs through sources"));
        assert_eq!(def.model.as_deref(), Some("openai/gpt-4o"));
        assert_eq!(
            def.allowed_tools,
            AllowScope::Named(vec!["read_file".into(), "web_search".into(), "web_fetch".into()])
        );
        assert_eq!(def.allowed_skills, AllowScope::None);
        assert!(def.body.contains("Cite sources."));
        assert!(!def.body.contains("---"));
    }

    #[test]
    fn list_agents_workspace_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("workspace");
        let builtin = dir.path().join("builtin");

        create_agent(&ws.join("agents"), "writer", "---\nname: writer\n---\n\n# Custom writer");
        create_agent(&builtin, "writer", "---\nname: writer\n---\n\n# Builtin writer");
        create_agent(&builtin, "researcher", "---\nname: researcher\n---\n\n# Researcher");

        let loader = AgentDefinitionLoader::new(&ws, Some(builtin));
        let agents = loader.list_agents();
        assert_eq!(agents.len(), 2);
        let writer = agents.iter().find(|a| a.name == "writer").unwrap();
        assert_eq!(writer.source, AgentSource::Workspace);
    }

    #[test]
    fn load_agent_workspace_then_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("workspace");
        let builtin = dir.path().join("builtin");
        create_agent(&builtin, "researcher", "---\nname: researcher\nmodel: groq/llama\n---\n\n# Researcher");

        let loader = AgentDefinitionLoader::new(&ws, Some(builtin));
        let def = loader.load_agent("researcher").unwrap();
        assert_eq!(def.source, AgentSource::Builtin);
        assert_eq!(def.model.as_deref(), Some("groq/llama"));
    }

    #[test]
    fn load_agent_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AgentDefinitionLoader::new(dir.path(), None);
        assert!(loader.load_agent("nope").is_none());
    }

    #[test]
    fn list_agents_empty_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let loader = AgentDefinitionLoader::new(dir.path(), None);
        assert!(loader.list_agents().is_empty());
    }
}
