use lex_harness::mcp::{McpTool, ToolAnnotations};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Volatility
// ---------------------------------------------------------------------------

/// How quickly a tool's upstream data changes, which decides its cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Volatility {
    /// Published opinions, citations, court metadata. Effectively immutable.
    Static,
    /// Dockets: updated, but rarely within an hour.
    Stable,
    /// Search results.
    Volatile,
}

impl Volatility {
    /// TTL for this class. `Volatile` uses the configured default.
    pub fn ttl(self, default: Duration) -> Duration {
        match self {
            Self::Static => Duration::from_secs(86_400),
            Self::Stable => Duration::from_secs(3_600),
            Self::Volatile => default,
        }
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArgumentError {
    #[error("arguments must be a JSON object")]
    NotAnObject,
    #[error("missing required argument `{0}`")]
    Missing(&'static str),
    #[error("argument `{name}` must be {expected}")]
    WrongType {
        name: &'static str,
        expected: &'static str,
    },
    #[error("argument `{name}` must be between {min} and {max}")]
    OutOfRange { name: &'static str, min: i64, max: i64 },
    #[error("unknown argument `{0}`")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    /// Positive integer id or count, with an inclusive range.
    Integer { min: i64, max: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

const fn string(name: &'static str, required: bool, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind: ParamKind::String,
        required,
        description,
    }
}

const fn id(name: &'static str, description: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        kind: ParamKind::Integer { min: 1, max: i64::MAX },
        required: true,
        description,
    }
}

const SEARCH_OPINIONS: &[ParamSpec] = &[
    string("query", true, "Full-text query"),
    string("court", false, "Court id filter, e.g. `scotus` or `ca9`"),
    string("filed_after", false, "Only opinions filed on or after this date (YYYY-MM-DD)"),
    string("filed_before", false, "Only opinions filed on or before this date (YYYY-MM-DD)"),
    ParamSpec {
        name: "page_size",
        kind: ParamKind::Integer { min: 1, max: 100 },
        required: false,
        description: "Results per page",
    },
];
const GET_OPINION: &[ParamSpec] = &[id("opinion_id", "Opinion id")];
const GET_CLUSTER: &[ParamSpec] = &[id("cluster_id", "Opinion cluster id")];
const SEARCH_DOCKETS: &[ParamSpec] = &[
    string("query", true, "Full-text query"),
    string("court", false, "Court id filter"),
];
const GET_DOCKET: &[ParamSpec] = &[id("docket_id", "Docket id")];
const LIST_COURTS: &[ParamSpec] = &[string(
    "jurisdiction",
    false,
    "Jurisdiction code, e.g. `F` (federal appellate) or `S` (state supreme)",
)];
const LOOKUP_CITATION: &[ParamSpec] = &[string("citation", true, "Reporter citation, e.g. `410 U.S. 113`")];

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegalTool {
    SearchOpinions,
    GetOpinion,
    GetCluster,
    SearchDockets,
    GetDocket,
    ListCourts,
    LookupCitation,
}

/// Path and query string for one upstream request, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl LegalTool {
    pub const ALL: [LegalTool; 7] = [
        Self::SearchOpinions,
        Self::GetOpinion,
        Self::GetCluster,
        Self::SearchDockets,
        Self::GetDocket,
        Self::ListCourts,
        Self::LookupCitation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SearchOpinions => "search_opinions",
            Self::GetOpinion => "get_opinion",
            Self::GetCluster => "get_cluster",
            Self::SearchDockets => "search_dockets",
            Self::GetDocket => "get_docket",
            Self::ListCourts => "list_courts",
            Self::LookupCitation => "lookup_citation",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::SearchOpinions => "Search court opinions by full text, court, and filing date.",
            Self::GetOpinion => "Fetch a single opinion, including its text, by id.",
            Self::GetCluster => "Fetch an opinion cluster (case name, citations, judges) by id.",
            Self::SearchDockets => "Search federal dockets by full text and court.",
            Self::GetDocket => "Fetch a docket and its metadata by id.",
            Self::ListCourts => "List courts, optionally filtered by jurisdiction.",
            Self::LookupCitation => "Resolve a reporter citation to the opinions it refers to.",
        }
    }

    pub fn volatility(self) -> Volatility {
        match self {
            Self::SearchOpinions | Self::SearchDockets => Volatility::Volatile,
            Self::GetDocket => Volatility::Stable,
            Self::GetOpinion | Self::GetCluster | Self::ListCourts | Self::LookupCitation => Volatility::Static,
        }
    }

    pub fn params(self) -> &'static [ParamSpec] {
        match self {
            Self::SearchOpinions => SEARCH_OPINIONS,
            Self::GetOpinion => GET_OPINION,
            Self::GetCluster => GET_CLUSTER,
            Self::SearchDockets => SEARCH_DOCKETS,
            Self::GetDocket => GET_DOCKET,
            Self::ListCourts => LIST_COURTS,
            Self::LookupCitation => LOOKUP_CITATION,
        }
    }

    /// JSON Schema of the arguments object.
    pub fn input_schema(self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in self.params() {
            let schema = match p.kind {
                ParamKind::String => json!({ "type": "string", "description": p.description }),
                ParamKind::Integer { min, max } if max == i64::MAX => {
                    json!({ "type": "integer", "minimum": min, "description": p.description })
                }
                ParamKind::Integer { min, max } => {
                    json!({ "type": "integer", "minimum": min, "maximum": max, "description": p.description })
                }
            };
            properties.insert(p.name.to_string(), schema);
            if p.required {
                required.push(p.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn mcp_tool(self) -> McpTool {
        McpTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            annotations: Some(ToolAnnotations::read_only_remote()),
        }
    }

    /// Check `args` against the schema and return them as an object holding
    /// only declared keys. `null` is accepted as "no arguments".
    pub fn validate(self, args: &Value) -> Result<Map<String, Value>, ArgumentError> {
        let obj = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err(ArgumentError::NotAnObject),
        };
        let specs = self.params();

        if let Some(unknown) = obj.keys().find(|k| !specs.iter().any(|p| p.name == k.as_str())) {
            return Err(ArgumentError::Unknown(unknown.clone()));
        }

        for p in specs {
            match (obj.get(p.name), p.kind) {
                (None | Some(Value::Null), _) if p.required => return Err(ArgumentError::Missing(p.name)),
                (None | Some(Value::Null), _) => {}
                (Some(Value::String(s)), ParamKind::String) => {
                    if p.required && s.trim().is_empty() {
                        return Err(ArgumentError::Missing(p.name));
                    }
                }
                (Some(_), ParamKind::String) => {
                    return Err(ArgumentError::WrongType {
                        name: p.name,
                        expected: "a string",
                    })
                }
                (Some(v), ParamKind::Integer { min, max }) => {
                    let n = v.as_i64().ok_or(ArgumentError::WrongType {
                        name: p.name,
                        expected: "an integer",
                    })?;
                    if n < min || n > max {
                        return Err(ArgumentError::OutOfRange { name: p.name, min, max });
                    }
                }
            }
        }

        Ok(obj.into_iter().filter(|(_, v)| !v.is_null()).collect())
    }

    /// Upstream route for validated arguments.
    pub fn request(self, args: &Map<String, Value>) -> UpstreamRequest {
        let text = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
        let num = |key: &str| args.get(key).and_then(Value::as_i64).unwrap_or_default();

        let mut query: Vec<(String, String)> = Vec::new();
        let mut push = |k: &str, v: Option<String>| {
            if let Some(v) = v {
                query.push((k.to_string(), v));
            }
        };

        let path = match self {
            Self::SearchOpinions => {
                push("type", Some("o".into()));
                push("q", text("query"));
                push("court", text("court"));
                push("filed_after", text("filed_after"));
                push("filed_before", text("filed_before"));
                push("page_size", args.get("page_size").and_then(Value::as_i64).map(|n| n.to_string()));
                "/search/".to_string()
            }
            Self::SearchDockets => {
                push("type", Some("r".into()));
                push("q", text("query"));
                push("court", text("court"));
                "/search/".to_string()
            }
            Self::LookupCitation => {
                push("type", Some("o".into()));
                push("citation", text("citation"));
                "/search/".to_string()
            }
            Self::ListCourts => {
                push("jurisdiction", text("jurisdiction"));
                "/courts/".to_string()
            }
            Self::GetOpinion => format!("/opinions/{}/", num("opinion_id")),
            Self::GetCluster => format!("/clusters/{}/", num("cluster_id")),
            Self::GetDocket => format!("/dockets/{}/", num("docket_id")),
        };

        UpstreamRequest { path, query }
    }
}

impl std::fmt::Display for LegalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Every tool as an MCP definition, in catalogue order.
pub fn mcp_tools() -> Vec<McpTool> {
    LegalTool::ALL.into_iter().map(LegalTool::mcp_tool).collect()
}
