//! JSON-LD-style context.
//!
//! A context maps local names to IRIs and carries the directives the engine
//! honors: `@reverse` (invert subject/object in selection and patterns),
//! `@container: @list` (element order preserved via metadata indexes) and
//! `@type: @id` (string values are subject references). Prefix entries
//! expand `prefix:suffix` names.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermDef {
    pub iri: String,
    /// Traverse `opst` instead of `spot`: the term names incoming edges.
    pub reverse: bool,
    /// `@container: @list`.
    pub list: bool,
    /// `@type: @id`: string values name subjects.
    pub type_id: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    terms: BTreeMap<String, TermDef>,
}

impl Context {
    pub fn parse(v: &Value) -> Result<Context> {
        let mut terms = BTreeMap::new();
        let Some(obj) = v.as_object() else {
            return Err(Error::InvalidQuery("context must be an object".into()));
        };
        for (name, entry) in obj {
            let def = match entry {
                Value::String(iri) => TermDef {
                    iri: iri.clone(),
                    ..TermDef::default()
                },
                Value::Object(map) => {
                    let mut def = TermDef::default();
                    for (k, val) in map {
                        match (k.as_str(), val) {
                            ("@id" | "id", Value::String(iri)) => def.iri = iri.clone(),
                            ("@reverse" | "reverse", Value::String(iri)) => {
                                def.iri = iri.clone();
                                def.reverse = true;
                            }
                            ("@container" | "container", Value::String(c)) if c == "@list" => {
                                def.list = true;
                            }
                            ("@type" | "type", Value::String(t)) if t == "@id" => {
                                def.type_id = true;
                            }
                            _ => {
                                return Err(Error::InvalidQuery(format!(
                                    "unsupported context directive {k} for term {name}"
                                )));
                            }
                        }
                    }
                    if def.iri.is_empty() {
                        def.iri = name.clone();
                    }
                    def
                }
                _ => {
                    return Err(Error::InvalidQuery(format!(
                        "context entry {name} must be a string or object"
                    )));
                }
            };
            terms.insert(name.clone(), def);
        }
        Ok(Context { terms })
    }

    pub fn term(&self, name: &str) -> Option<&TermDef> {
        self.terms.get(name)
    }

    /// Expand a local name to its IRI. Term entries win, then prefix
    /// expansion on `prefix:suffix`, then the name itself.
    pub fn expand(&self, name: &str) -> String {
        if let Some(def) = self.terms.get(name) {
            return def.iri.clone();
        }
        if let Some((prefix, suffix)) = name.split_once(':') {
            if let Some(def) = self.terms.get(prefix) {
                if !def.reverse {
                    return format!("{}{}", def.iri, suffix);
                }
            }
        }
        name.to_string()
    }

    /// Compact an IRI back to the shortest local name this context defines.
    pub fn compact(&self, iri: &str) -> String {
        for (name, def) in &self.terms {
            if !def.reverse && def.iri == iri {
                return name.clone();
            }
        }
        for (name, def) in &self.terms {
            if !def.reverse {
                if let Some(suffix) = iri.strip_prefix(def.iri.as_str()) {
                    if !suffix.is_empty() && def.iri.len() > 1 {
                        return format!("{name}:{suffix}");
                    }
                }
            }
        }
        iri.to_string()
    }

    /// Whether values of `name` are @list-ordered under this context.
    pub fn is_list(&self, name: &str) -> bool {
        self.terms.get(name).map(|d| d.list).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliases_prefixes_and_directives_parse() -> Result<()> {
        let ctx = Context::parse(&json!({
            "ex": "http://example.org/",
            "name": "http://schema.org/name",
            "friended": {"reverse": "ex/friend"},
            "nums": {"@id": "ex/favNums", "@container": "@list"},
            "knows": {"@id": "ex/knows", "@type": "@id"},
        }))?;

        assert_eq!(ctx.expand("name"), "http://schema.org/name");
        assert_eq!(ctx.expand("ex:alice"), "http://example.org/alice");
        assert_eq!(ctx.expand("untouched/term"), "untouched/term");

        let friended = ctx.term("friended").unwrap();
        assert!(friended.reverse);
        assert_eq!(friended.iri, "ex/friend");

        assert!(ctx.is_list("nums"));
        assert!(ctx.term("knows").unwrap().type_id);
        Ok(())
    }

    #[test]
    fn compact_prefers_exact_alias() -> Result<()> {
        let ctx = Context::parse(&json!({
            "ex": "http://example.org/",
            "alice": "http://example.org/alice",
        }))?;
        assert_eq!(ctx.compact("http://example.org/alice"), "alice");
        assert_eq!(ctx.compact("http://example.org/bob"), "ex:bob");
        assert_eq!(ctx.compact("urn:other"), "urn:other");
        Ok(())
    }

    #[test]
    fn malformed_context_is_invalid_query() {
        let err = Context::parse(&json!(["not", "an", "object"])).unwrap_err();
        assert_eq!(err.code(), "invalid-query");
        let err = Context::parse(&json!({"x": {"@container": "@set"}})).unwrap_err();
        assert_eq!(err.code(), "invalid-query");
    }
}
