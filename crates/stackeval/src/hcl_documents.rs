//! collection of hcl documents ([Body] and the source it was read from)
//!
//! [HclDocuments] tracks
//! - the source (path and contents, for diagnostics)
//! - the root blocks
//! - the root attributes
//! and defines a numeric index for each. Once added those indices are stable (removal is not possible)
use hcl_edit::structure::{Attribute, Block, Body, Structure};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files ending in this suffix are picked up when loading a directory
pub const FILE_SUFFIX: &str = ".stack.hcl";

#[derive(Default, Debug)]
pub struct HclDocuments {
    sources: Vec<Arc<SourceFile>>,
    root_attributes: Vec<(usize, Attribute)>,
    root_blocks: Vec<(usize, Block)>,
}

impl HclDocuments {
    /// Inserts and indexes an hcl document
    pub fn insert(&mut self, document: Body, source: SourceFile) {
        let source_index = self.sources.len();
        self.sources.push(Arc::new(source));

        for structure in document.into_iter() {
            match structure {
                Structure::Block(block) => self.root_blocks.push((source_index, block)),
                Structure::Attribute(attribute) => {
                    self.root_attributes.push((source_index, attribute))
                }
            }
        }
    }

    /// Parses and inserts a document
    pub fn parse_str(
        &mut self,
        contents: &str,
        path: impl Into<Option<PathBuf>>,
    ) -> Result<(), LoadError> {
        let body = hcl_edit::parser::parse_body(contents)?;
        self.insert(body, SourceFile::new(path.into(), contents.to_string()));
        Ok(())
    }

    pub fn attributes(&self) -> impl Iterator<Item = SourceAttribute> {
        self.root_attributes
            .iter()
            .map(|(source_index, attribute)| (&self.sources[*source_index], attribute))
    }

    pub fn blocks(&self) -> impl Iterator<Item = SourceBlock> {
        self.root_blocks
            .iter()
            .map(|(source_index, block)| (&self.sources[*source_index], block))
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

impl HclDocuments {
    pub fn load_file(&mut self, file_path: &Path) -> Result<(), LoadError> {
        let file_path = file_path.canonicalize()?;
        tracing::info!(path=%file_path.display(), "loading file");

        let file_contents = std::fs::read_to_string(&file_path)?;
        self.parse_str(&file_contents, file_path)
    }

    pub fn load_directory(&mut self, dir_path: &Path) -> Result<(), LoadError> {
        let mut any_files_loaded = false;

        let mut file_paths = vec![];
        for dir_entry in std::fs::read_dir(dir_path)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }

            let is_stack_file = dir_entry
                .file_name()
                .to_string_lossy()
                .ends_with(FILE_SUFFIX);
            if is_stack_file {
                file_paths.push(dir_entry.path());
            }
        }

        // declaration order follows file names
        file_paths.sort();
        for file_path in file_paths {
            self.load_file(&file_path)?;
            any_files_loaded = true;
        }

        if !any_files_loaded {
            return Err(LoadError::NoFilesFound);
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("No files found in directory")]
    NoFilesFound,
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Unable to parse hcl file")]
    HclParseFailed(#[from] hcl_edit::parser::Error),
}

/// Utility macro to create [HclDocuments]
///
/// Create from a single document
/// ```
/// # use stackeval::hcl_documents;
/// hcl_documents!("output \"answer\" { value = 42 }");
/// ```
///
/// Create from multiple documents (path required)
/// ```
/// # use stackeval::hcl_documents;
/// hcl_documents! {
///   "one.stack.hcl" => "variable \"one\" {}",
///   "two.stack.hcl" => "variable \"two\" {}"
/// };
/// ```
///
/// # Panic
/// Panics on invalid input
///
/// ```should_panic
/// # use stackeval::hcl_documents;
/// hcl_documents!("not = valid = hcl");
/// ```
#[macro_export]
macro_rules! hcl_documents {
    // single document without source
    { $expr:expr } => {{
        let mut docs = $crate::hcl_documents::HclDocuments::default();
        docs.parse_str($expr, None::<::std::path::PathBuf>).expect("body must parse");
        docs
    }};
    // multi document with sources
    { $($source:expr => $expr:expr),+ } => {{
        let mut docs = $crate::hcl_documents::HclDocuments::default();
        $(
            docs.parse_str($expr, Some(::std::path::PathBuf::from($source))).expect("body must parse");
        )+

        docs
    }};
}

/// A loaded document's origin and text
#[derive(Debug, derive_new::new)]
pub struct SourceFile {
    pub path: Option<PathBuf>,
    pub contents: String,
}

impl SourceFile {
    /// Resolves a byte span of this file into a [SourceRange]
    pub fn range(self: &Arc<Self>, span: Option<Range<usize>>) -> SourceRange {
        let span = span.unwrap_or(0..0);
        SourceRange {
            path: self.path.clone(),
            start: self.pos(span.start),
            end: self.pos(span.end),
        }
    }

    fn pos(&self, byte: usize) -> SourcePos {
        let byte = byte.min(self.contents.len());
        let before = &self.contents.as_bytes()[..byte];
        let line = before.iter().filter(|b| **b == b'\n').count() + 1;
        let line_start = before
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |newline| newline + 1);
        SourcePos {
            line,
            column: byte - line_start + 1,
            byte,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
    pub byte: usize,
}

/// Where in the loaded documents something was declared
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceRange {
    pub path: Option<PathBuf>,
    pub start: SourcePos,
    pub end: SourcePos,
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}", path.display())?,
            None => f.write_str("<input>")?,
        }
        write!(f, " line {}", self.start.line)
    }
}

pub type SourceAttribute<'a> = (&'a Arc<SourceFile>, &'a Attribute);
pub type SourceBlock<'a> = (&'a Arc<SourceFile>, &'a Block);

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    #[test]
    fn iterators() {
        let hcl_documents = hcl_documents! {r#"
        attr_1 = 1
        one two {}
        three four five {}
        attr_2 = 2
        attr_3 = 3
        "#};

        assert_eq!(hcl_documents.attributes().count(), 3);
        assert_eq!(hcl_documents.blocks().count(), 2);
    }

    #[test]
    fn multiple_sources() {
        let hcl_documents = hcl_documents! {
            "a.stack.hcl" => "one {}",
            "b.stack.hcl" => "two {}"
        };

        assert_eq!(hcl_documents.source_count(), 2);
        let paths: Vec<_> = hcl_documents
            .blocks()
            .map(|(source, _)| source.path.clone().unwrap())
            .collect();
        assert_eq!(
            paths,
            [PathBuf::from("a.stack.hcl"), PathBuf::from("b.stack.hcl")]
        );
    }

    #[test]
    fn byte_offsets_resolve_to_lines() {
        let source = Arc::new(SourceFile::new(None, "a = 1\nbb = 2\n".into()));
        let range = source.range(Some(8..9));

        assert_eq!(range.start, SourcePos { line: 2, column: 3, byte: 8 });
        assert_eq!(range.to_string(), "<input> line 2");
    }
}
