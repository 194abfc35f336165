//! Plain text display of replay results

use crate::{profile::StackProfile, LifecycleCounts};
use activity_stacks::{asylum::CallStackInterner, CallStackIndex};
use termtree::{GlyphPalette, Tree};

/// Glyphs used to draw hierarchical profiles
const PALETTE: GlyphPalette = GlyphPalette {
    middle_item: "├",
    last_item: "└",
    item_indent: "─",
    middle_skip: "│",
    last_skip: " ",
    skip_indent: " ",
};

/// Display how many lifecycle notifications went by
pub fn print_lifecycle_counts(counts: &LifecycleCounts) {
    println!("\nActivity lifecycle:");
    println!("- {} created", counts.created);
    println!("- {} started", counts.started);
    println!("- {} stopped", counts.stopped);
    println!("- {} awaits unblocked", counts.unblocked);
}

/// Display the share of samples taken in each kind of activity
pub fn print_kind_breakdown(profile: &StackProfile) {
    println!("\nSamples by kind of running activity:");
    for (kind, count) in profile.kind_breakdown().iter() {
        let percent = *count as f64 / profile.total() as f64 * 100.0;
        println!("- {} [{count} samples, {percent:.2}%]", kind.name());
    }
}

/// Display the hierarchical profile of synthesized call stacks
pub fn print_hierarchical_profile(
    profile: &StackProfile,
    output: &CallStackInterner,
    threshold: f64,
) {
    println!("\nHierarchical profile ({} samples):", profile.total());
    let roots = profile.hottest_roots(threshold);
    for &root in roots.iter() {
        println!(
            "{}",
            hierarchical_profile_tree(profile, output, root, threshold)
        );
    }
    let num_shown: usize = roots.iter().map(|&root| profile.inclusive(root)).sum();
    let num_hidden = profile.total() - num_shown;
    if num_hidden > 0 {
        println!(
            "… {num_hidden} samples in roots below {:.2}% …",
            threshold * 100.0
        );
    }
}

/// Make a tree display of the profile below some node
fn hierarchical_profile_tree(
    profile: &StackProfile,
    output: &CallStackInterner,
    node: CallStackIndex,
    threshold: f64,
) -> Tree<Box<str>> {
    let tree = Tree::new(node_label(profile, output, node)).with_glyphs(PALETTE);

    // Render hottest callees
    let num_callees = profile.callees(node).len();
    let hottest_callees = profile.hottest_callees(node, threshold);
    let num_hottest = hottest_callees.len();
    let make_child_tree =
        |callee| hierarchical_profile_tree(profile, output, callee, threshold);
    if num_hottest == num_callees {
        tree.with_leaves(hottest_callees.into_vec().into_iter().map(make_child_tree))
    } else {
        // If there are more callees, warn about it
        let terminator = format!(
            "…{} callee(s) below {:.2}%…",
            num_callees - num_hottest,
            threshold * 100.0
        );
        tree.with_leaves(
            hottest_callees
                .into_vec()
                .into_iter()
                .map(make_child_tree)
                .chain(std::iter::once(
                    Tree::new(terminator.into_boxed_str()).with_glyphs(PALETTE),
                )),
        )
    }
}

/// Label of a profile node: frame name and sample counts
fn node_label(
    profile: &StackProfile,
    output: &CallStackInterner,
    node: CallStackIndex,
) -> Box<str> {
    let name = output.frame_name(output.frame(node));
    let inclusive = profile.inclusive(node);
    let percent = profile.fraction(node) * 100.0;
    let exclusive = profile.exclusive(node);
    let label = if exclusive > 0 {
        format!("{name} [{inclusive} samples, {percent:.2}%, {exclusive} self]")
    } else {
        format!("{name} [{inclusive} samples, {percent:.2}%]")
    };
    label.into_boxed_str()
}
