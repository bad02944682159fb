// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub use saiga_err::*;

/// Node classification yielded by directory iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Unknown,
}

/// Per-entry information reported by [`FileSystem::dir`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub is_dir: bool,
    /// Modification time in seconds since the Unix epoch.
    pub mtime_seconds: u64,
}

pub trait FileSystem: Sized {
    type File: File;

    /// Resolves an absolute `/`-separated path to a regular file. The file
    /// carries its own mount; dropping it releases the mount.
    fn open(self, path: &str) -> Result<Self::File>;

    /// Resolves an absolute path to a directory and reports each entry to
    /// `hook`. A `true` return from the hook stops the listing.
    fn dir(&mut self, path: &str, hook: &mut dyn FnMut(&str, &EntryInfo) -> bool) -> Result<()>;

    /// The volume name.
    fn label(&self) -> Result<String>;

    /// The volume identifier, rendered as lowercase hex.
    fn uuid(&self) -> Result<String>;
}

pub trait File {
    /// Reads from the current cursor position, advancing it. Returns 0 at
    /// end of file.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Moves the cursor. Not validated until the next read.
    fn seek(&mut self, position: u64);

    /// The file size in bytes.
    fn size(&self) -> u64;
}

/// Directory iteration backend consumed by [`find_file`].
pub trait DirectoryWalk {
    type Node;

    /// Iterates over `directory`, handing each child to `hook`; ownership of
    /// the child node passes to the hook. Returns whether the hook stopped
    /// the iteration early.
    fn iterate(
        &self,
        directory: &Self::Node,
        hook: &mut dyn FnMut(&str, FileKind, Self::Node) -> bool,
    ) -> Result<bool>;
}

/// Resolves an absolute `/`-separated path, descending from `root` one
/// component at a time through [`DirectoryWalk::iterate`].
///
/// `.` components are ignored and `..` ascends, staying put at the root.
/// Every intermediate component shall resolve to a directory, and the final
/// node shall match `expected`.
pub fn find_file<W: DirectoryWalk>(
    walk: &W,
    root: W::Node,
    path: &str,
    expected: FileKind,
) -> Result<W::Node> {
    let mut lineage = vec![(root, FileKind::Directory)];
    for component in path.split('/').filter(|component| !component.is_empty()) {
        match component {
            "." => continue,
            ".." => {
                if lineage.len() > 1 {
                    lineage.pop();
                }
                continue;
            }
            _ => {}
        }

        let (directory, kind) = lineage.last().unwrap();
        if *kind != FileKind::Directory {
            return Err(Error::Fs(FsError::BadFileType));
        }
        let mut found = None;
        walk.iterate(directory, &mut |name, kind, node| {
            if name == component {
                found = Some((node, kind));
                return true;
            }
            false
        })?;
        match found {
            Some(child) => lineage.push(child),
            None => return Err(Error::Fs(FsError::FileNotFound)),
        }
    }

    let (node, kind) = lineage.pop().unwrap();
    if kind != expected {
        return Err(Error::Fs(FsError::BadFileType));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory tree: node 0 is the root, directories list (name, child)
    /// pairs.
    struct TreeWalk {
        nodes: Vec<(FileKind, Vec<(&'static str, usize)>)>,
    }

    impl DirectoryWalk for TreeWalk {
        type Node = usize;

        fn iterate(
            &self,
            directory: &usize,
            hook: &mut dyn FnMut(&str, FileKind, usize) -> bool,
        ) -> Result<bool> {
            let (kind, children) = &self.nodes[*directory];
            if *kind != FileKind::Directory {
                return Err(Error::Fs(FsError::BadFileType));
            }
            for (name, child) in children {
                if hook(name, self.nodes[*child].0, *child) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    fn sample_tree() -> TreeWalk {
        TreeWalk {
            nodes: vec![
                (FileKind::Directory, vec![("boot", 1), ("readme", 3)]),
                (FileKind::Directory, vec![("kernel", 2)]),
                (FileKind::Regular, vec![]),
                (FileKind::Regular, vec![]),
            ],
        }
    }

    #[test]
    fn resolves_nested_path() {
        assert_eq!(
            find_file(&sample_tree(), 0, "/boot/kernel", FileKind::Regular).unwrap(),
            2
        );
    }

    #[test]
    fn resolves_root() {
        assert_eq!(find_file(&sample_tree(), 0, "/", FileKind::Directory).unwrap(), 0);
    }

    #[test]
    fn ignores_dot_and_empty_components() {
        assert_eq!(
            find_file(&sample_tree(), 0, "//boot/./kernel", FileKind::Regular).unwrap(),
            2
        );
    }

    #[test]
    fn dot_dot_ascends_and_stays_at_root() {
        assert_eq!(
            find_file(&sample_tree(), 0, "/boot/../../readme", FileKind::Regular).unwrap(),
            3
        );
    }

    #[test]
    fn missing_component_is_not_found() {
        assert!(matches!(
            find_file(&sample_tree(), 0, "/boot/missing", FileKind::Regular),
            Err(Error::Fs(FsError::FileNotFound))
        ));
    }

    #[test]
    fn file_as_intermediate_component_is_bad_file_type() {
        assert!(matches!(
            find_file(&sample_tree(), 0, "/readme/kernel", FileKind::Regular),
            Err(Error::Fs(FsError::BadFileType))
        ));
    }

    #[test]
    fn kind_mismatch_is_bad_file_type() {
        assert!(matches!(
            find_file(&sample_tree(), 0, "/boot", FileKind::Regular),
            Err(Error::Fs(FsError::BadFileType))
        ));
        assert!(matches!(
            find_file(&sample_tree(), 0, "/readme", FileKind::Directory),
            Err(Error::Fs(FsError::BadFileType))
        ));
    }
}
