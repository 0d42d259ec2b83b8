use super::ArcType;
use super::prim_index::{NodeRef, PrimIndex};
use std::io::Write;

/// Reports misuse of the cache API. The call that detected it returns a default.
macro_rules! coding_error {
	($($arg:tt)+) => {
		tracing::error!(target: "pcp::coding_error", $($arg)+)
	};
}

/// Checks an internal invariant.
///
/// Fails hard in debug builds and logs in release builds. Evaluates to the
/// condition so callers can continue on a best-effort basis.
macro_rules! verify {
	($cond:expr, $($arg:tt)+) => {{
		let ok: bool = $cond;
		if !ok {
			tracing::error!(target: "pcp::verify", $($arg)+);
			debug_assert!(ok, $($arg)+);
		}
		ok
	}};
}

pub(crate) use coding_error;
pub(crate) use verify;

/// Writes the graph of `index` in Graphviz dot format.
pub fn dump_dot_graph(index: &PrimIndex, writer: &mut dyn Write) -> std::io::Result<()> {
	writeln!(writer, "digraph PcpPrimIndex {{")?;
	if let Some(root) = index.root_node() {
		write_graph(writer, root)?;
	}
	writeln!(writer, "}}")?;
	Ok(())
}

fn write_graph(writer: &mut dyn Write, node: NodeRef) -> std::io::Result<()> {
	let layer_id = node.layer_stack().root_layer().identifier().to_string();
	let layer_name = std::path::Path::new(&layer_id)
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or(layer_id);

	let mut flags = Vec::new();
	if node.has_specs() {
		flags.push("specs");
	}
	if node.is_inert() {
		flags.push("inert");
	}
	if node.is_due_to_ancestor() {
		flags.push("ancestral");
	}

	let node_label = format!(
		"@{}@<{}> ({})\\n{}",
		layer_name,
		node.path(),
		node.index(),
		flags.join(", ")
	);

	writeln!(
		writer,
		"\t{} [label=\"{}\", shape=\"box\"{}];",
		node.index(),
		node_label,
		if node.is_inert() { ", style=dashed" } else { "" }
	)?;

	for child in node.children() {
		let (color, label) = match child.arc_type() {
			ArcType::Local => ("black", "local"),
			ArcType::Inherit => ("green", "inherit"),
			ArcType::Variant => ("orange", "variant"),
			ArcType::Reference => ("red", "reference"),
			ArcType::Relocate => ("purple", "relocate"),
			ArcType::Payload => ("indigo", "payload"),
			ArcType::Specialize => ("sienna", "specialize"),
		};

		writeln!(
			writer,
			"\t{} -> {} [label=\"{}\", color={}];",
			node.index(),
			child.index(),
			label,
			color
		)?;

		if let Some(origin) = child.origin()
			&& origin.index() != node.index()
		{
			writeln!(
				writer,
				"\t{} -> {} [style=dotted, label=\"origin\", constraint=false];",
				child.index(),
				origin.index()
			)?;
		}

		write_graph(writer, child)?;
	}

	Ok(())
}
