use anyhow::{anyhow, bail, Context, Result};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};
use std::collections::HashMap;

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guards against cyclic `Parent` chains in broken files.
const MAX_TREE_DEPTH: usize = 64;

/// Limit on arrays and dictionaries written inline inside one another.
const MAX_NESTING: usize = 128;

/// Rewrites PDF bytes into a new document.
pub trait PdfTransform: Send + Sync {
    fn rewrite(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Default transform: copies every page into a fresh document and saves it.
#[derive(Clone, Copy, Debug)]
pub struct PdfRewriter {
    /// Flate-compress streams that carry no filter yet.
    pub compress_streams: bool,
}

impl Default for PdfRewriter {
    fn default() -> Self {
        PdfRewriter {
            compress_streams: true,
        }
    }
}

impl PdfTransform for PdfRewriter {
    fn rewrite(&self, input: &[u8]) -> Result<Vec<u8>> {
        let source = load_document(input)?;
        let mut doc = copy_pages(&source)?;
        log::debug!(
            "copied {} pages into {} objects",
            doc.get_pages().len(),
            doc.objects.len()
        );
        save_document(&mut doc, self.compress_streams)
    }
}

pub fn load_document(input: &[u8]) -> Result<Document> {
    let mut doc = Document::load_mem(input).context("Failed to load PDF")?;

    if doc.is_encrypted() {
        log::warn!("PDF is encrypted. Attempting to decrypt with empty password...");
        doc.decrypt("")
            .map_err(|e| anyhow!("Failed to decrypt with empty password: {:?}", e))?;
    }

    Ok(doc)
}

pub fn save_document(doc: &mut Document, compress_streams: bool) -> Result<Vec<u8>> {
    if compress_streams {
        doc.compress();
    }
    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).context("Failed to save PDF")?;
    Ok(buffer)
}

/// Builds a new document holding a copy of every page of `source`, in order.
pub fn copy_pages(source: &Document) -> Result<Document> {
    let mut target = Document::with_version(source.version.clone());
    let pages_root = target.new_object_id();

    let pages = source.get_pages();
    let mut copier = PageCopier::new(source, &mut target, pages_root);
    // Register every page first so links between pages resolve to the copies.
    let page_ids: Vec<(ObjectId, ObjectId)> = pages
        .values()
        .map(|&id| (id, copier.reserve(id)))
        .collect();

    let mut kids = Vec::with_capacity(page_ids.len());
    for (source_id, target_id) in page_ids {
        copier
            .copy_page(source_id, target_id)
            .with_context(|| format!("Failed to copy page object {} {}", source_id.0, source_id.1))?;
        kids.push(Object::Reference(target_id));
    }

    let count = kids.len() as i64;
    target.objects.insert(
        pages_root,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = target.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_root,
    });
    target.trailer.set("Root", catalog_id);

    Ok(target)
}

struct PageCopier<'a> {
    source: &'a Document,
    target: &'a mut Document,
    pages_root: ObjectId,
    ids: HashMap<ObjectId, ObjectId>,
    /// Indirect objects reserved in the target but not copied yet.
    pending: Vec<(ObjectId, ObjectId)>,
}

impl<'a> PageCopier<'a> {
    fn new(source: &'a Document, target: &'a mut Document, pages_root: ObjectId) -> Self {
        PageCopier {
            source,
            target,
            pages_root,
            ids: HashMap::new(),
            pending: Vec::new(),
        }
    }

    fn reserve(&mut self, source_id: ObjectId) -> ObjectId {
        let id = self.target.new_object_id();
        self.ids.insert(source_id, id);
        id
    }

    fn copy_page(&mut self, source_id: ObjectId, target_id: ObjectId) -> Result<()> {
        let source = self.source;
        let page = source
            .get_object(source_id)
            .and_then(Object::as_dict)
            .map_err(|e| anyhow!("Page is not a dictionary: {:?}", e))?;

        let mut flattened = page.clone();
        flattened.remove(b"Parent");
        for key in INHERITABLE {
            if flattened.get(key).is_err() {
                if let Some(value) = inherited(source, page, key) {
                    flattened.set(key.to_vec(), value.clone());
                }
            }
        }

        let mut copied = self.copy_dictionary(&flattened, 0)?;
        copied.set("Parent", self.pages_root);
        self.target
            .objects
            .insert(target_id, Object::Dictionary(copied));
        self.drain()
    }

    /// Copies every object queued by `copy_reference`, including the ones it queues
    /// itself, so reference chains of any length run in constant stack.
    fn drain(&mut self) -> Result<()> {
        let source = self.source;
        while let Some((source_id, target_id)) = self.pending.pop() {
            let object = source
                .get_object(source_id)
                .map_err(|e| anyhow!("Object {} {} vanished: {:?}", source_id.0, source_id.1, e))?;
            let copied = self.copy_object(object, 0)?;
            self.target.objects.insert(target_id, copied);
        }
        Ok(())
    }

    /// Rewrites one object's inline arrays and dictionaries; references only enqueue.
    fn copy_object(&mut self, object: &Object, depth: usize) -> Result<Object> {
        if depth > MAX_NESTING {
            bail!("Objects nested deeper than {} levels", MAX_NESTING);
        }
        Ok(match object {
            Object::Reference(id) => Object::Reference(self.copy_reference(*id)),
            Object::Array(items) => Object::Array(
                items
                    .iter()
                    .map(|item| self.copy_object(item, depth + 1))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Object::Dictionary(dict) => Object::Dictionary(self.copy_dictionary(dict, depth + 1)?),
            Object::Stream(stream) => {
                let mut stream = stream.clone();
                stream.dict = self.copy_dictionary(&stream.dict, depth + 1)?;
                Object::Stream(stream)
            }
            other => other.clone(),
        })
    }

    fn copy_dictionary(&mut self, dict: &Dictionary, depth: usize) -> Result<Dictionary> {
        let mut copied = Dictionary::new();
        for (key, value) in dict.iter() {
            copied.set(key.clone(), self.copy_object(value, depth)?);
        }
        Ok(copied)
    }

    fn copy_reference(&mut self, source_id: ObjectId) -> ObjectId {
        if let Some(&id) = self.ids.get(&source_id) {
            return id;
        }

        let source = self.source;
        let object = match source.get_object(source_id) {
            Ok(object) => object,
            Err(_) => {
                log::warn!(
                    "dangling reference {} {} replaced with null",
                    source_id.0,
                    source_id.1
                );
                let id = self.reserve(source_id);
                self.target.objects.insert(id, Object::Null);
                return id;
            }
        };

        // Nodes of the old page tree collapse onto the new root
        if is_pages_node(object) {
            self.ids.insert(source_id, self.pages_root);
            return self.pages_root;
        }

        // Reserved before copying so cycles terminate
        let id = self.reserve(source_id);
        self.pending.push((source_id, id));
        id
    }
}

fn is_pages_node(object: &Object) -> bool {
    object
        .as_dict()
        .and_then(|dict| dict.get(b"Type"))
        .and_then(Object::as_name)
        .map(|name| name == b"Pages")
        .unwrap_or(false)
}

fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut node = page;
    for _ in 0..MAX_TREE_DEPTH {
        let parent_id = node.get(b"Parent").and_then(Object::as_reference).ok()?;
        node = doc.get_dictionary(parent_id).ok()?;
        if let Ok(value) = node.get(key) {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::Stream;

    fn page_texts(doc: &Document) -> Vec<String> {
        doc.get_pages()
            .values()
            .map(|&id| String::from_utf8_lossy(&doc.get_page_content(id).unwrap()).into_owned())
            .collect()
    }

    /// Two pages under an intermediate `Pages` node that carries the `MediaBox`.
    fn nested_tree() -> Document {
        let mut doc = Document::with_version("1.5");
        let root_id = doc.new_object_id();
        let branch_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let mut kids = Vec::new();
        for text in ["first", "second"] {
            let content = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", text);
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => branch_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            branch_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Parent" => root_id,
                "Kids" => kids,
                "Count" => 2,
                "MediaBox" => vec![0.into(), 0.into(), 300.into(), 400.into()],
            }),
        );
        doc.objects.insert(
            root_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(branch_id)],
                "Count" => 2,
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                },
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => root_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    #[test]
    fn inherited_attributes_land_on_each_page() {
        let source = nested_tree();
        let copy = copy_pages(&source).unwrap();

        assert_eq!(page_texts(&copy), page_texts(&source));
        for (_, page_id) in copy.get_pages() {
            let page = copy.get_dictionary(page_id).unwrap();
            let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
            assert_eq!(media_box[3].as_i64().unwrap(), 400);
            assert!(page.get(b"Resources").is_ok());
        }
    }

    #[test]
    fn copied_pages_hang_off_a_single_flat_tree() {
        let copy = copy_pages(&nested_tree()).unwrap();
        let catalog_id = copy
            .trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .unwrap();
        let root_id = copy
            .get_dictionary(catalog_id)
            .unwrap()
            .get(b"Pages")
            .unwrap()
            .as_reference()
            .unwrap();

        let pages_nodes = copy.objects.values().filter(|o| is_pages_node(o)).count();
        assert_eq!(pages_nodes, 1);
        for (_, page_id) in copy.get_pages() {
            let parent = copy
                .get_dictionary(page_id)
                .unwrap()
                .get(b"Parent")
                .unwrap()
                .as_reference()
                .unwrap();
            assert_eq!(parent, root_id);
        }
    }

    #[test]
    fn page_links_point_at_the_copies() {
        let mut source = nested_tree();
        let pages: Vec<ObjectId> = source.get_pages().values().copied().collect();
        let annot_id = source.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Link",
            "Rect" => vec![0.into(), 0.into(), 10.into(), 10.into()],
            "Dest" => vec![Object::Reference(pages[1]), "Fit".into()],
        });
        if let Ok(Object::Dictionary(page)) = source.get_object_mut(pages[0]) {
            page.set("Annots", vec![Object::Reference(annot_id)]);
        }

        let copy = copy_pages(&source).unwrap();
        let copied: Vec<ObjectId> = copy.get_pages().values().copied().collect();
        let annots = copy
            .get_dictionary(copied[0])
            .unwrap()
            .get(b"Annots")
            .unwrap()
            .as_array()
            .unwrap();
        let annot = copy
            .get_dictionary(annots[0].as_reference().unwrap())
            .unwrap();
        let dest = annot.get(b"Dest").unwrap().as_array().unwrap();
        assert_eq!(dest[0].as_reference().unwrap(), copied[1]);
    }

    #[test]
    fn long_bead_chains_copy_without_recursion() {
        const BEADS: usize = 10_000;
        let mut source = nested_tree();
        let first = *source.get_pages().values().next().unwrap();
        let beads: Vec<ObjectId> = (0..BEADS).map(|_| source.new_object_id()).collect();
        for (i, &id) in beads.iter().enumerate() {
            let next = beads.get(i + 1).map_or(Object::Null, |&n| Object::Reference(n));
            source.objects.insert(
                id,
                Object::Dictionary(dictionary! {
                    "Type" => "Bead",
                    "N" => next,
                }),
            );
        }
        if let Ok(Object::Dictionary(page)) = source.get_object_mut(first) {
            page.set("B", vec![Object::Reference(beads[0])]);
        }

        let copy = copy_pages(&source).unwrap();
        let first = *copy.get_pages().values().next().unwrap();
        let mut next = copy.get_dictionary(first).unwrap().get(b"B").unwrap().as_array().unwrap()[0].clone();
        let mut hops = 0;
        while let Object::Reference(id) = next {
            hops += 1;
            next = copy.get_dictionary(id).unwrap().get(b"N").unwrap().clone();
        }
        assert_eq!(hops, BEADS);
    }

    #[test]
    fn absurd_inline_nesting_is_an_error() {
        let mut source = nested_tree();
        let first = *source.get_pages().values().next().unwrap();
        let mut nested = Object::Null;
        for _ in 0..=MAX_NESTING + 1 {
            nested = Object::Array(vec![nested]);
        }
        if let Ok(Object::Dictionary(page)) = source.get_object_mut(first) {
            page.set("Deep", nested);
        }

        assert!(copy_pages(&source).is_err());
    }

    #[test]
    fn dangling_references_become_null() {
        let mut source = nested_tree();
        let first = *source.get_pages().values().next().unwrap();
        if let Ok(Object::Dictionary(page)) = source.get_object_mut(first) {
            page.set("Thumb", Object::Reference((999, 0)));
        }

        let copy = copy_pages(&source).unwrap();
        let first = *copy.get_pages().values().next().unwrap();
        let thumb = copy
            .get_dictionary(first)
            .unwrap()
            .get(b"Thumb")
            .unwrap()
            .as_reference()
            .unwrap();
        assert!(matches!(copy.get_object(thumb), Ok(Object::Null)));
    }

    #[test]
    fn empty_document_still_saves() {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => Vec::<Object>::new(),
            "Count" => 0,
        });
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut copy = copy_pages(&doc).unwrap();
        let bytes = save_document(&mut copy, true).unwrap();
        let reloaded = Document::load_mem(&bytes).unwrap();
        assert!(reloaded.get_pages().is_empty());
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(PdfRewriter::default().rewrite(b"%PDF-1.4 nothing here").is_err());
    }
}
