//! Minimal builder for mermaid flowcharts, used by the debugging exports.

use std::fmt::Write;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Round,
    Box,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Line {
    Normal,
    Dotted,
}

#[derive(Debug, Default)]
pub struct Mermaid {
    out: String,
    styles: Vec<String>,
    depth: usize,
}

impl Mermaid {
    /// Renders a left-to-right flowchart built by `build`.
    pub fn render(build: impl FnOnce(&mut Mermaid)) -> String {
        let mut builder = Mermaid {
            out: String::from("flowchart LR\n"),
            styles: Vec::new(),
            depth: 1,
        };
        build(&mut builder);

        let mut out = builder.out;
        for style in builder.styles {
            out.push_str("    ");
            out.push_str(&style);
            out.push('\n');
        }
        out
    }

    pub fn node(&mut self, id: &str, label: &str, shape: Shape, style: Option<&str>) {
        let label = escape(label);
        let line = match shape {
            Shape::Round => format!("{id}(\"{label}\")"),
            Shape::Box => format!("{id}[\"{label}\"]"),
        };
        self.push_line(&line);
        if let Some(style) = style {
            self.styles.push(format!("style {id} {style}"));
        }
    }

    /// Opens a subgraph, lets `body` fill it and returns its id so it can be
    /// linked.
    pub fn subgraph(&mut self, id: &str, title: &str, body: impl FnOnce(&mut Mermaid)) -> String {
        self.push_line(&format!("subgraph {id}[\"{}\"]", escape(title)));
        self.depth += 1;
        body(self);
        self.depth -= 1;
        self.push_line("end");
        id.to_string()
    }

    pub fn link(&mut self, from: &str, to: &str, label: Option<&str>, line: Line) {
        let arrow = match line {
            Line::Normal => "-->",
            Line::Dotted => "-.->",
        };
        let line = match label {
            Some(label) => format!("{from} {arrow}|\"{}\"| {to}", escape(label)),
            None => format!("{from} {arrow} {to}"),
        };
        self.push_line(&line);
    }

    fn push_line(&mut self, line: &str) {
        // Writing into a String cannot fail.
        let _ = writeln!(self.out, "{}{line}", "    ".repeat(self.depth));
    }
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nodes_subgraphs_and_links() {
        let diagram = Mermaid::render(|b| {
            b.node("W0", "Root", Shape::Round, None);
            let group = b.subgraph("W1", "Wallet 1", |g| {
                g.node("W1Info", "usage: 10", Shape::Box, Some("text-align:left"));
            });
            b.link(&group, "W0", Some("10"), Line::Normal);
        });

        assert_eq!(
            diagram,
            "flowchart LR\n\
             \x20   W0(\"Root\")\n\
             \x20   subgraph W1[\"Wallet 1\"]\n\
             \x20       W1Info[\"usage: 10\"]\n\
             \x20   end\n\
             \x20   W1 -->|\"10\"| W0\n\
             \x20   style W1Info text-align:left\n"
        );
    }

    #[test]
    fn quotes_are_escaped() {
        let diagram = Mermaid::render(|b| b.node("A", "say \"hi\"", Shape::Round, None));
        assert!(diagram.contains("A(\"say #quot;hi#quot;\")"));
    }
}
