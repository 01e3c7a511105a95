//! Tool name to provider index.

use std::collections::BTreeMap;

use tether_mcp::ToolInfo;

/// One advertised tool and the connections currently offering it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// Definition from the first provider that listed the tool.
    pub tool: ToolInfo,
    pub providers: Vec<String>,
}

/// Merged view of every ready connection's `tools/list`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl ToolRegistry {
    /// Merge per-connection tool lists. Provider order follows input order.
    pub fn build<I>(lists: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<ToolInfo>)>,
    {
        let mut entries: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for (connection, tools) in lists {
            for tool in tools {
                let entry = entries
                    .entry(tool.name.clone())
                    .or_insert_with(|| RegistryEntry {
                        tool,
                        providers: Vec::new(),
                    });
                if !entry.providers.contains(&connection) {
                    entry.providers.push(connection.clone());
                }
            }
        }
        Self { entries }
    }

    pub fn providers(&self, tool: &str) -> Option<&[String]> {
        self.entries.get(tool).map(|e| e.providers.as_slice())
    }

    pub fn get(&self, tool: &str) -> Option<&RegistryEntry> {
        self.entries.get(tool)
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.entries.contains_key(tool)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.entries.values().map(|e| e.tool.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> ToolInfo {
        ToolInfo {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn merges_providers_by_tool_name() {
        let registry = ToolRegistry::build(vec![
            ("a".to_string(), vec![tool("search", "from a"), tool("fetch", "")]),
            ("b".to_string(), vec![tool("search", "from b")]),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.providers("search").unwrap(), ["a", "b"]);
        assert_eq!(registry.providers("fetch").unwrap(), ["a"]);
        // First definition wins
        assert_eq!(registry.get("search").unwrap().tool.description, "from a");
    }

    #[test]
    fn unknown_tool_has_no_providers() {
        let registry = ToolRegistry::build(vec![("a".to_string(), vec![tool("x", "")])]);
        assert!(registry.providers("y").is_none());
        assert!(!registry.contains("y"));
    }

    #[test]
    fn duplicate_listing_from_one_connection_counted_once() {
        let registry = ToolRegistry::build(vec![(
            "a".to_string(),
            vec![tool("x", ""), tool("x", "")],
        )]);
        assert_eq!(registry.providers("x").unwrap(), ["a"]);
    }

    #[test]
    fn tools_are_sorted_by_name() {
        let registry = ToolRegistry::build(vec![(
            "a".to_string(),
            vec![tool("zeta", ""), tool("alpha", "")],
        )]);
        let names: Vec<String> = registry.tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(ToolRegistry::default().is_empty());
    }
}
