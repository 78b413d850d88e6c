//! Schema Context Builder
//!
//! Renders a [`SchemaDescriptor`] into the bounded text block handed to the
//! SQL generator. Output depends only on the descriptor, the requesting role
//! and the static notes, so the same inputs always produce the same text.

use crate::schema::introspector::{SchemaDescriptor, TableDescriptor};
use crate::security::policy::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Static domain notes shown after the table listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextNotes {
    pub table_descriptions: BTreeMap<String, String>,
    pub domain_notes: Vec<String>,
}

pub struct SchemaContextBuilder {
    notes: ContextNotes,
    max_chars: usize,
}

impl SchemaContextBuilder {
    pub fn new(notes: ContextNotes, max_chars: usize) -> Self {
        Self { notes, max_chars }
    }

    /// The output never exceeds `max_chars` bytes. The trailer is kept
    /// first; tables then lose their samples, then drop off the end.
    pub fn build(&self, schema: &SchemaDescriptor, role: &Role) -> String {
        let trailer = self.render_trailer(schema, role);
        if trailer.len() >= self.max_chars {
            return truncate(&trailer, self.max_chars).to_string();
        }
        let budget = if trailer.is_empty() {
            self.max_chars
        } else {
            self.max_chars - trailer.len() - 1
        };

        let mut blocks: Vec<String> = Vec::with_capacity(schema.tables().len());
        let mut used = 0usize;
        let mut omitted = 0usize;

        for (idx, table) in schema.tables().iter().enumerate() {
            let separator = usize::from(!blocks.is_empty());
            let full = render_table(table, role, true);
            let block = if used + separator + full.len() <= budget {
                full
            } else {
                // Second chance without sample values
                let bare = render_table(table, role, false);
                if used + separator + bare.len() > budget {
                    omitted = schema.tables().len() - idx;
                    break;
                }
                bare
            };
            used += separator + block.len();
            blocks.push(block);
        }

        // Make room for the omission line by giving up trailing tables
        while omitted > 0 {
            let line = format!("... {} more tables omitted", omitted);
            let separator = usize::from(!blocks.is_empty());
            if used + separator + line.len() <= budget {
                blocks.push(line);
                break;
            }
            match blocks.pop() {
                Some(block) => {
                    used -= block.len() + usize::from(!blocks.is_empty());
                    omitted += 1;
                }
                None => break,
            }
        }

        let mut context = blocks.join("\n");
        if !trailer.is_empty() {
            if !context.is_empty() {
                context.push('\n');
            }
            context.push_str(&trailer);
        }
        context
    }

    fn render_trailer(&self, schema: &SchemaDescriptor, role: &Role) -> String {
        let mut lines = Vec::new();

        let descriptions: Vec<String> = self
            .notes
            .table_descriptions
            .iter()
            .filter(|(table, _)| schema.has_table(table))
            .map(|(table, text)| format!("  - {}: {}", table, text))
            .collect();
        if !descriptions.is_empty() {
            lines.push("TABLE DESCRIPTIONS:".to_string());
            lines.extend(descriptions);
        }

        if !self.notes.domain_notes.is_empty() {
            lines.push("NOTES:".to_string());
            lines.extend(self.notes.domain_notes.iter().map(|n| format!("  - {}", n)));
        }

        if !role.can_view_all_rows {
            let scoped: Vec<&str> = schema
                .tables()
                .iter()
                .filter(|t| t.owner_scoped)
                .map(|t| t.name.as_str())
                .collect();
            if !scoped.is_empty() {
                lines.push("ACCESS:".to_string());
                lines.push(format!(
                    "  - Results are restricted to the user's own rows. Queries on {} must select the {} column from the table itself, and must not read those tables through subqueries, derived tables or window functions.",
                    scoped.join(", "),
                    schema.owner_column()
                ));
            }
        }

        lines.join("\n")
    }
}

/// Longest prefix of `text` within `max` bytes that ends on a char boundary
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn render_table(table: &TableDescriptor, role: &Role, with_samples: bool) -> String {
    let mut lines = vec![
        format!("TABLE: {} (~{} rows)", table.name, table.row_count),
        "Columns:".to_string(),
    ];

    for column in &table.columns {
        if column.sensitive && !role.can_view_sensitive {
            continue;
        }
        let mut line = format!("  - {}: {}", column.name, column.column_type.sql_name());
        if !column.nullable {
            line.push_str(" NOT NULL");
        }
        if with_samples && !column.samples.is_empty() {
            line.push_str(" e.g. ");
            line.push_str(&column.samples.join(", "));
        }
        lines.push(line);
    }

    let mut block = lines.join("\n");
    block.push('\n');
    block
}
