use grammar_core::Alphabet;
use itertools::Itertools;

use super::{Automaton, Role, StateKind};

fn sanitize_dot_ident(name: &str) -> String {
    name.chars()
        .map(|chr| if chr.is_alphanumeric() { chr } else { '_' })
        .collect()
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

impl Automaton {
    /// Compute the graphviz representation, for more information on the DOT format,
    /// see the [graphviz documentation](https://graphviz.org/doc/info/lang.html).
    pub fn to_dot(&self, alphabet: &Alphabet) -> String {
        let header = std::iter::once(format!("digraph {} {{", sanitize_dot_ident(&self.name)));

        let states = self.states.iter().map(|q| {
            let shape = match q.kind {
                StateKind::Normal => "ellipse",
                StateKind::Start => "point",
                StateKind::Sink => "doublecircle",
            };
            let style = match q.role {
                Role::Client => "solid",
                Role::Server => "dashed",
            };
            let initial = if q.id == self.initial { ", penwidth=2" } else { "" };
            format!(
                "{} [label=\"{}\", shape={shape}, style={style}{initial}]",
                sanitize_dot_ident(&q.name),
                escape(&q.name)
            )
        });

        let transitions = self.transitions.iter().map(|t| {
            format!(
                "{} -> {} [label=\"{}\"]",
                sanitize_dot_ident(&self.states[t.source.index()].name),
                sanitize_dot_ident(&self.states[t.target.index()].name),
                escape(&format!(
                    "{} {{{}}}",
                    t.name,
                    t.outputs
                        .iter()
                        .map(|s| alphabet.show_symbol(*s))
                        .chain(t.unknown_output.then(|| "?".to_string()))
                        .join(", ")
                ))
            )
        });

        header
            .chain(states)
            .chain(transitions)
            .chain(std::iter::once("}".to_string()))
            .join("\n")
    }
}
