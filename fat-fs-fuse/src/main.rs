use clap::{App, Arg};
use fat_fs::{BlockDevice, Clock, FatFileSystem, FsError, Namespace, BLOCK_SZ};
use log::LevelFilter;
use std::fs::{read_dir, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

struct BlockFile(Mutex<File>);

impl BlockDevice for BlockFile {
  fn read_blocks(&self, start_block: usize, buf: &mut [u8]) -> usize {
    assert_eq!(buf.len() % BLOCK_SZ, 0, "Not a whole number of blocks!");
    let mut file = self.0.lock().unwrap();
    if file
      .seek(SeekFrom::Start((start_block * BLOCK_SZ) as u64))
      .is_err()
    {
      return 0;
    }
    match file.read_exact(buf) {
      Ok(()) => buf.len() / BLOCK_SZ,
      Err(_) => 0,
    }
  }

  fn write_blocks(&self, start_block: usize, buf: &[u8]) -> usize {
    assert_eq!(buf.len() % BLOCK_SZ, 0, "Not a whole number of blocks!");
    let mut file = self.0.lock().unwrap();
    if file
      .seek(SeekFrom::Start((start_block * BLOCK_SZ) as u64))
      .is_err()
    {
      return 0;
    }
    match file.write_all(buf) {
      Ok(()) => buf.len() / BLOCK_SZ,
      Err(_) => 0,
    }
  }
}

struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> u64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or(0)
  }
}

struct SimpleLogger;

impl log::Log for SimpleLogger {
  fn enabled(&self, _metadata: &log::Metadata) -> bool {
    true
  }

  fn log(&self, record: &log::Record) {
    println!("[{}] {}", record.level(), record.args());
  }

  fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

fn init_logging() {
  let _ = log::set_logger(&LOGGER);
  log::set_max_level(LevelFilter::Info);
}

fn to_io(err: FsError) -> std::io::Error {
  std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", err))
}

pub fn main() {
  init_logging();
  volume_tool().expect("Error when building the volume image");
}

fn open_image(path: &str, blocks: usize) -> std::io::Result<Arc<BlockFile>> {
  let f = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .open(path)?;
  f.set_len((blocks * BLOCK_SZ) as u64)?;
  Ok(Arc::new(BlockFile(Mutex::new(f))))
}

fn volume_tool() -> std::io::Result<()> {
  let matches = App::new("FAT volume tool")
    .arg(
      Arg::with_name("image")
        .short("i")
        .long("image")
        .takes_value(true)
        .required(true)
        .help("Backing image file"),
    )
    .arg(
      Arg::with_name("blocks")
        .short("b")
        .long("blocks")
        .takes_value(true)
        .help("Volume size in 4096-byte blocks"),
    )
    .arg(
      Arg::with_name("mkdir")
        .long("mkdir")
        .takes_value(true)
        .multiple(true)
        .help("Directory path to create inside the image"),
    )
    .arg(
      Arg::with_name("source")
        .short("s")
        .long("source")
        .takes_value(true)
        .help("Host directory whose subdirectories are mirrored into the image root"),
    )
    .arg(
      Arg::with_name("list")
        .long("list")
        .takes_value(true)
        .help("Directory to list once the changes are applied"),
    )
    .get_matches();

  let image = matches.value_of("image").unwrap();
  let blocks: usize = matches
    .value_of("blocks")
    .unwrap_or("8192")
    .parse()
    .expect("blocks must be a number");

  println!("image = {}, blocks = {}", image, blocks);
  let block_file = open_image(image, blocks)?;

  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), blocks).map_err(to_io)?;
  let mut ns = Namespace::new(fs).map_err(to_io)?;

  if let Some(paths) = matches.values_of("mkdir") {
    for path in paths {
      ns.mkdir(path).map_err(to_io)?;
      println!("created {}", path);
    }
  }

  if let Some(src) = matches.value_of("source") {
    for dirent in read_dir(src)? {
      let dirent = dirent?;
      if dirent.file_type()?.is_dir() {
        let name = dirent.file_name().into_string().unwrap();
        ns.mkdir(&format!("/{}", name)).map_err(to_io)?;
        println!("mirrored {}/", name);
      }
    }
  }

  if let Some(path) = matches.value_of("list") {
    println!("listing of {}:", path);
    for item in ns.open_dir(path).map_err(to_io)? {
      println!("  {:?}\t{}", item.kind, item.name);
    }
  }

  Ok(())
}

#[cfg(test)]
fn test_image(name: &str, blocks: usize) -> Arc<BlockFile> {
  std::fs::create_dir_all("target").unwrap();
  let path = format!("target/{}.img", name);
  let _ = std::fs::remove_file(&path);
  open_image(&path, blocks).unwrap()
}

#[cfg(test)]
fn test_namespace(name: &str, blocks: usize) -> Namespace {
  let block_file = test_image(name, blocks);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), blocks).unwrap();
  Namespace::new(fs).unwrap()
}

#[test]
fn end_to_end_format_and_mkdir() {
  use fat_fs::FileType;

  let block_file = test_image("e2e", 1000);
  let fs = FatFileSystem::mount(block_file.clone(), Arc::new(SystemClock), 1000).unwrap();
  let mut ns = Namespace::new(fs).unwrap();

  assert!(ns.is_dir("/"));
  assert!(!ns.is_file("/"));

  ns.mkdir("/a").unwrap();
  ns.mkdir("/a/b").unwrap();

  let listed: Vec<String> = ns.open_dir("/a").unwrap().map(|item| item.name).collect();
  assert_eq!(listed, [".", "..", "b"]);
  for item in ns.open_dir("/a").unwrap() {
    assert_eq!(item.kind, FileType::Directory);
  }

  // a second mount must find the signature and keep the namespace
  drop(ns);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 1000).unwrap();
  let ns = Namespace::new(fs).unwrap();
  assert!(ns.is_dir("/a/b"));
  assert!(ns.is_dir("/a"));
  assert!(!ns.is_file("/a"));
}

#[test]
fn allocation_is_disjoint_and_accounted() {
  let block_file = test_image("alloc", 1000);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 1000).unwrap();
  let mut fs = fs.lock();

  let free_before = fs.free_blocks();
  let a = fs.allocate_blocks(3).unwrap();
  let b = fs.allocate_blocks(4).unwrap();
  assert_eq!(fs.free_blocks(), free_before - 7);

  let chain_a = fs.chain_blocks(a).unwrap();
  let chain_b = fs.chain_blocks(b).unwrap();
  assert_eq!(chain_a.len(), 3);
  assert_eq!(chain_b.len(), 4);
  assert!(chain_a.iter().all(|blk| !chain_b.contains(blk)));

  // the root chain stays disjoint from both fresh runs
  let root = fs.descriptor().root_dir_start as usize;
  let chain_root = fs.chain_blocks(root).unwrap();
  assert!(chain_root.iter().all(|blk| !chain_a.contains(blk) && !chain_b.contains(blk)));
}

#[test]
fn insufficient_space_fails_without_mutation() {
  let block_file = test_image("nospace", 32);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 32).unwrap();
  let mut fs = fs.lock();

  let free = fs.free_blocks() as usize;
  assert_eq!(
    fs.allocate_blocks(free + 1),
    Err(FsError::InsufficientSpace)
  );
  assert_eq!(fs.free_blocks() as usize, free);

  // the table was left untouched, a smaller request still succeeds
  let run = fs.allocate_blocks(free).unwrap();
  assert_eq!(fs.chain_blocks(run).unwrap().len(), free);
  assert_eq!(fs.free_blocks(), 0);
}

#[test]
fn fragmented_volume_reports_no_contiguous_run() {
  // Format, then poke one end-of-chain marker into the on-disk table so the
  // data region splits into two short runs, and remount over it.
  let block_file = test_image("frag", 64);
  {
    let fs = FatFileSystem::mount(block_file.clone(), Arc::new(SystemClock), 64).unwrap();
    let fs = fs.lock();
    let table_start = fs.descriptor().table_start as usize;
    let poked_block = (fs.descriptor().data_start as usize + 64) / 2 + 8;

    let mut table_block = vec![0u8; BLOCK_SZ];
    assert_eq!(block_file.read_blocks(table_start, &mut table_block), 1);
    let offset = poked_block * 8;
    table_block[offset..offset + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    assert_eq!(block_file.write_blocks(table_start, &table_block), 1);
  }

  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 64).unwrap();
  let mut fs = fs.lock();
  let free = fs.free_blocks() as usize;
  // enough blocks in total, but no single run long enough
  assert!(free >= 40);
  assert_eq!(fs.allocate_blocks(40), Err(FsError::NoContiguousRun));
}

#[test]
fn collapse_is_idempotent_and_canonical() {
  use fat_fs::collapse;

  assert_eq!(collapse("/a/./b/../c/"), "/a/c/");
  assert_eq!(collapse("/a/c/"), "/a/c/");
  assert_eq!(collapse(&collapse("/a/./b/../c/")), collapse("/a/./b/../c/"));
  assert_eq!(collapse("/"), "/");
  assert_eq!(collapse("/../../x/"), "/x/");
  assert_eq!(collapse("a//b///c"), "/a/b/c/");
  assert_eq!(collapse("/a/b/../../../"), "/");
}

#[test]
fn created_directory_bootstraps_dot_entries() {
  let block_file = test_image("dots", 256);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 256).unwrap();
  let mut fs = fs.lock();

  let root_start = fs.descriptor().root_dir_start;
  let root = fs.load_dir_at(root_start).unwrap();
  assert_eq!(root.slot(0).name(), ".");
  assert_eq!(root.slot(0).first_block(), root_start);
  // the root's parent is itself
  assert_eq!(root.slot(1).name(), "..");
  assert_eq!(root.slot(1).first_block(), root_start);

  let child = fs.create_dir(51, Some(root.slot(0))).unwrap();
  assert_eq!(child.slot(0).name(), ".");
  assert_eq!(child.slot(0).first_block(), child.first_block());
  assert_eq!(child.slot(0).size(), child.byte_size());
  assert!(child.slot(0).is_dir());
  assert_eq!(child.slot(1).name(), "..");
  assert_eq!(child.slot(1).first_block(), root.first_block());
  assert!(!child.slot(2).is_in_use());
}

#[test]
fn load_after_create_round_trips() {
  let block_file = test_image("roundtrip", 256);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 256).unwrap();
  let mut fs = fs.lock();

  let root_start = fs.descriptor().root_dir_start;
  let root = fs.load_dir_at(root_start).unwrap();
  let created = fs.create_dir(51, Some(root.slot(0))).unwrap();
  fs.flush_table().unwrap();

  let loaded = fs.load_dir(created.slot(0)).unwrap();
  assert_eq!(loaded.slot(0).as_bytes(), created.slot(0).as_bytes());
  assert_eq!(loaded.slot(1).as_bytes(), created.slot(1).as_bytes());
  assert_eq!(loaded.byte_size(), created.byte_size());
}

#[test]
fn resolve_root_and_missing_components() {
  use fat_fs::Resolved;

  let mut ns = test_namespace("resolve", 512);
  assert!(matches!(ns.resolve("/").unwrap(), Resolved::Root));

  match ns.resolve("/fresh").unwrap() {
    Resolved::Missing { name, .. } => assert_eq!(name, "fresh"),
    _ => panic!("expected a missing final component"),
  }
  // a path through a non-existent directory is a hard failure
  assert!(matches!(ns.resolve("/ghost/x"), Err(FsError::NotFound)));
  assert!(matches!(ns.resolve(""), Err(FsError::InvalidPath)));

  ns.mkdir("/fresh").unwrap();
  match ns.resolve("/fresh").unwrap() {
    Resolved::Found { parent, index, .. } => assert!(parent.slot(index).is_dir()),
    _ => panic!("expected the component to be found"),
  }
}

#[test]
fn file_in_the_middle_of_a_path_is_a_hard_failure() {
  use fat_fs::{DirEntry, FileType};

  let block_file = test_image("midfile", 512);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 512).unwrap();
  {
    let mut guard = fs.lock();
    let root_start = guard.descriptor().root_dir_start;
    let mut root = guard.load_dir_at(root_start).unwrap();
    let first = guard.allocate_blocks(1).unwrap();
    let slot = root.first_free_slot().unwrap();
    let now = guard.now();
    *root.slot_mut(slot) = DirEntry::new("f", FileType::File, first as u64, 0, now).unwrap();
    guard.write_back(&root).unwrap();
    guard.flush_table().unwrap();
    guard.persist_descriptor().unwrap();
  }

  let ns = Namespace::new(fs).unwrap();
  assert!(ns.is_file("/f"));
  assert!(!ns.is_dir("/f"));
  assert!(matches!(ns.resolve("/f/x"), Err(FsError::NotFound)));
  assert!(ns.open_dir("/f").is_err());
}

#[test]
fn set_cwd_tracks_buffer_and_canonical_path() {
  let mut ns = test_namespace("cwd", 1000);
  ns.mkdir("/a").unwrap();
  ns.mkdir("/a/b").unwrap();

  assert_eq!(ns.cwd(), "/");
  ns.set_cwd("a").unwrap();
  assert_eq!(ns.cwd(), "/a/");

  // relative creation goes through the CWD buffer
  ns.mkdir("c").unwrap();
  assert!(ns.is_dir("/a/c"));

  ns.set_cwd("b").unwrap();
  assert_eq!(ns.cwd(), "/a/b/");
  ns.set_cwd("..").unwrap();
  assert_eq!(ns.cwd(), "/a/");
  ns.set_cwd("..").unwrap();
  assert_eq!(ns.cwd(), "/");
  // collapsing above root stays at root
  ns.set_cwd("..").unwrap();
  assert_eq!(ns.cwd(), "/");

  ns.set_cwd("/a/b/").unwrap();
  assert_eq!(ns.cwd(), "/a/b/");
  assert_eq!(ns.set_cwd("/a/ghost"), Err(FsError::NotFound));
  // failure leaves both the buffer and the string untouched
  assert_eq!(ns.cwd(), "/a/b/");
}

#[test]
fn mkdir_error_taxonomy() {
  let mut ns = test_namespace("mkdir-errors", 1000);
  ns.mkdir("/a").unwrap();

  assert_eq!(ns.mkdir("/a"), Err(FsError::AlreadyExists));
  assert_eq!(ns.mkdir("/"), Err(FsError::AlreadyExists));
  assert_eq!(ns.mkdir("/ghost/b"), Err(FsError::NotFound));
  assert_eq!(ns.mkdir(""), Err(FsError::InvalidPath));
  let long = "x".repeat(64);
  assert_eq!(ns.mkdir(&format!("/{}", long)), Err(FsError::NameTooLong));
}

#[test]
fn full_parent_directory_is_its_own_error() {
  let mut ns = test_namespace("dirfull", 2000);
  ns.mkdir("/a").unwrap();
  // 51 slots, 2 taken by the dot entries
  for i in 0..49 {
    ns.mkdir(&format!("/a/d{}", i)).unwrap();
  }
  assert_eq!(ns.mkdir("/a/overflow"), Err(FsError::DirectoryFull));
}

#[test]
fn rejected_mkdir_allocates_nothing() {
  let block_file = test_image("mkdir-noleak", 2000);
  let fs = FatFileSystem::mount(block_file, Arc::new(SystemClock), 2000).unwrap();
  let mut ns = Namespace::new(fs.clone()).unwrap();
  ns.mkdir("/a").unwrap();

  // a name that cannot fit the record must fail before any block moves
  let free = fs.lock().free_blocks();
  let long = "x".repeat(64);
  assert_eq!(ns.mkdir(&format!("/a/{}", long)), Err(FsError::NameTooLong));
  assert_eq!(fs.lock().free_blocks(), free);

  // same for a parent with no free slot left
  for i in 0..49 {
    ns.mkdir(&format!("/a/d{}", i)).unwrap();
  }
  let free = fs.lock().free_blocks();
  assert_eq!(ns.mkdir("/a/overflow"), Err(FsError::DirectoryFull));
  assert_eq!(fs.lock().free_blocks(), free);
}

#[test]
fn stat_and_documented_gaps() {
  use fat_fs::{FileType, DIRENT_SZ};

  let mut ns = test_namespace("stat", 512);
  let root_stat = ns.stat("/").unwrap();
  assert_eq!(root_stat.kind, FileType::Directory);
  assert_eq!(root_stat.size, (51 * DIRENT_SZ) as u64);
  assert_eq!(root_stat.block_size, BLOCK_SZ as u64);
  assert_eq!(root_stat.blocks, 2);

  ns.mkdir("/a").unwrap();
  let stat = ns.stat("/a").unwrap();
  assert_eq!(stat.kind, FileType::Directory);
  assert_eq!(stat.size % DIRENT_SZ as u64, 0);
  assert!(stat.created > 0 && stat.modified > 0);

  assert_eq!(ns.stat("/ghost"), Err(FsError::NotFound));
  assert_eq!(ns.remove_dir("/a"), Err(FsError::Unsupported("remove_dir")));
  assert_eq!(ns.remove_file("/a"), Err(FsError::Unsupported("remove_file")));
}

#[test]
fn listing_contains_every_created_name() {
  use rand::Rng;

  let mut ns = test_namespace("listing", 2000);
  ns.mkdir("/r").unwrap();

  let mut rng = rand::thread_rng();
  let mut names = Vec::new();
  for _ in 0..20 {
    let name: String = (0..8).map(|_| char::from(b'a' + rng.gen_range(0..26))).collect();
    if names.contains(&name) {
      continue;
    }
    ns.mkdir(&format!("/r/{}", name)).unwrap();
    names.push(name);
  }

  let listed: Vec<String> = ns.open_dir("/r").unwrap().map(|item| item.name).collect();
  assert_eq!(listed[0], ".");
  assert_eq!(listed[1], "..");
  assert_eq!(listed.len(), names.len() + 2);
  for name in &names {
    assert!(listed.contains(name));
  }
}
