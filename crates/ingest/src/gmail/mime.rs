//! Generic MIME part tree traversal
//!
//! Message payloads can nest arbitrarily. Traversal uses an explicit stack
//! bounded by depth and node count instead of recursion.

use log::debug;

use super::api::MessagePart;

/// Parts nested deeper than this are skipped
pub const MAX_PART_DEPTH: usize = 32;

/// Traversal stops after visiting this many parts
pub const MAX_PARTS: usize = 512;

/// A node in a MIME part tree
pub trait MimeNode {
    fn mime_type(&self) -> Option<&str>;
    fn filename(&self) -> Option<&str>;
    /// Inline base64url body data, if the provider returned it
    fn inline_data(&self) -> Option<&str>;
    /// Provider reference for bodies that must be fetched separately
    fn attachment_id(&self) -> Option<&str>;
    fn children(&self) -> &[Self]
    where
        Self: Sized;
}

impl MimeNode for MessagePart {
    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    fn filename(&self) -> Option<&str> {
        self.filename.as_deref().filter(|f| !f.trim().is_empty())
    }

    fn inline_data(&self) -> Option<&str> {
        self.body
            .as_ref()?
            .data
            .as_deref()
            .filter(|d| !d.is_empty())
    }

    fn attachment_id(&self) -> Option<&str> {
        self.body
            .as_ref()?
            .attachment_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    fn children(&self) -> &[Self] {
        self.parts.as_deref().unwrap_or(&[])
    }
}

/// Visit every node depth-first, in document order
///
/// `visit` receives each node and its depth (root = 0). Returns false if the
/// walk was truncated by [`MAX_PART_DEPTH`] or [`MAX_PARTS`].
pub fn walk_parts<N: MimeNode>(root: &N, mut visit: impl FnMut(&N, usize)) -> bool {
    let mut stack: Vec<(&N, usize)> = vec![(root, 0)];
    let mut visited = 0usize;
    let mut complete = true;

    while let Some((node, depth)) = stack.pop() {
        if visited >= MAX_PARTS {
            debug!("MIME walk stopped after {} parts", MAX_PARTS);
            return false;
        }
        visited += 1;
        visit(node, depth);

        let children = node.children();
        if children.is_empty() {
            continue;
        }
        if depth + 1 > MAX_PART_DEPTH {
            debug!("Skipping {} MIME parts nested deeper than {}", children.len(), MAX_PART_DEPTH);
            complete = false;
            continue;
        }
        // Reverse so the first child is popped first
        for child in children.iter().rev() {
            stack.push((child, depth + 1));
        }
    }

    complete
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(mime: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            ..Default::default()
        }
    }

    fn multipart(children: Vec<MessagePart>) -> MessagePart {
        MessagePart {
            mime_type: Some("multipart/mixed".to_string()),
            parts: Some(children),
            ..Default::default()
        }
    }

    #[test]
    fn test_walk_document_order() {
        let tree = multipart(vec![
            multipart(vec![leaf("text/plain"), leaf("text/html")]),
            leaf("application/pdf"),
        ]);

        let mut seen = Vec::new();
        let complete = walk_parts(&tree, |node, depth| {
            seen.push((node.mime_type().unwrap_or_default().to_string(), depth));
        });

        assert!(complete);
        assert_eq!(
            seen,
            vec![
                ("multipart/mixed".to_string(), 0),
                ("multipart/mixed".to_string(), 1),
                ("text/plain".to_string(), 2),
                ("text/html".to_string(), 2),
                ("application/pdf".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_walk_depth_bound() {
        let mut tree = leaf("image/png");
        for _ in 0..(MAX_PART_DEPTH + 5) {
            tree = multipart(vec![tree]);
        }

        let mut images = 0;
        let complete = walk_parts(&tree, |node, _| {
            if node.mime_type() == Some("image/png") {
                images += 1;
            }
        });

        assert!(!complete);
        assert_eq!(images, 0);
    }

    #[test]
    fn test_empty_filename_is_none() {
        let part = MessagePart {
            filename: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(part.filename(), None);
    }
}
