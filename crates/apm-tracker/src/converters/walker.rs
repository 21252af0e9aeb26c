// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::layer::{Layer, LayerNode};
use crate::layer_children_set::Children;

/// Callbacks for a depth-first walk of a finished tree.
///
/// `before` and `visit` run when a node is entered, `after` once all of its
/// descendants have been walked.
pub trait LayerVisitor<'a> {
    fn before(&mut self, _layer: LayerNode<'a>) {}
    fn visit(&mut self, layer: LayerNode<'a>);
    fn after(&mut self, _layer: LayerNode<'a>) {}
}

/// Pre-order walk starting at `root`, children in call order.
///
/// Uses an explicit stack, so tree depth is bounded by memory rather than
/// the thread's stack size.
pub fn walk<'a, V>(root: &'a Layer, visitor: &mut V)
where
    V: LayerVisitor<'a> + ?Sized,
{
    let root = LayerNode::Detailed(root);
    visitor.before(root);
    visitor.visit(root);

    let mut stack: Vec<(LayerNode<'a>, Children<'a>)> = vec![(root, root.children())];
    while let Some((_, children)) = stack.last_mut() {
        match children.next() {
            Some(child) => {
                visitor.before(child);
                visitor.visit(child);
                stack.push((child, child.children()));
            }
            None => {
                if let Some((node, _)) = stack.pop() {
                    visitor.after(node);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl<'a> LayerVisitor<'a> for Recorder {
        fn before(&mut self, layer: LayerNode<'a>) {
            self.events.push(format!("before {}", layer.name()));
        }

        fn visit(&mut self, layer: LayerNode<'a>) {
            self.events.push(format!("visit {}", layer.name()));
        }

        fn after(&mut self, layer: LayerNode<'a>) {
            self.events.push(format!("after {}", layer.name()));
        }
    }

    fn finished(name: &str, children: Vec<Layer>) -> Layer {
        let start = Instant::now();
        let mut layer = Layer::new("Test", name, start);
        for child in children {
            layer.add_child(child);
        }
        layer.record_stop_time(start + Duration::from_millis(1));
        layer
    }

    #[test]
    fn test_pre_order_with_nested_hooks() {
        let tree = finished(
            "root",
            vec![
                finished("a", vec![finished("a1", vec![])]),
                finished("b", vec![]),
            ],
        );

        let mut recorder = Recorder::default();
        walk(&tree, &mut recorder);

        assert_eq!(
            recorder.events,
            vec![
                "before root",
                "visit root",
                "before a",
                "visit a",
                "before a1",
                "visit a1",
                "after a1",
                "after a",
                "before b",
                "visit b",
                "after b",
                "after root",
            ]
        );
    }

    #[test]
    fn test_deep_tree_does_not_overflow() {
        let mut tree = finished("leaf", vec![]);
        for i in 0..50_000 {
            tree = finished(&format!("n{i}"), vec![tree]);
        }

        struct Counter(usize);
        impl<'a> LayerVisitor<'a> for Counter {
            fn visit(&mut self, _layer: LayerNode<'a>) {
                self.0 += 1;
            }
        }

        let mut counter = Counter(0);
        walk(&tree, &mut counter);
        assert_eq!(counter.0, 50_001);
        drop(tree);
    }
}
