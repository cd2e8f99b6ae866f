use std::path::Path;

use anyhow::{Context, Result, bail};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn, WithTls};
use log::{debug, info, warn};

/// 数据库映射大小，此处直接分配 1TiB，文件本身是稀疏的
const MAP_SIZE: usize = 1 << 40;

/// 数据库的打开方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// 读写，不存在时创建
    Create,
    /// 读写，不存在时创建，并清空已有内容
    Clean,
    /// 只读，文件必须已经存在
    ReadOnly,
}

/// 图片路径到打包记录的持久化映射
pub struct IndexStore {
    /// lmdb env，此处使用了 Thread Local Storage，读事务不能跨线程
    env: Env<WithTls>,
    db: Database<Str, Bytes>,
    read_only: bool,
}

impl IndexStore {
    /// 打开单文件的 lmdb 数据库
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        info!("打开数据库: {} ({:?})", path.display(), mode);

        let read_only = mode == OpenMode::ReadOnly;
        let mut flags = EnvFlags::NO_SUB_DIR;
        if read_only {
            flags |= EnvFlags::READ_ONLY;
        }

        let mut options = EnvOpenOptions::new();
        options.map_size(MAP_SIZE).max_dbs(1);
        let env = unsafe {
            options.flags(flags);
            options.open(path)
        }
        .with_context(|| format!("无法打开数据库 '{}'", path.display()))?;

        let db = if read_only {
            let rtxn = env.read_txn()?;
            let db = env
                .open_database::<Str, Bytes>(&rtxn, None)?
                .with_context(|| format!("数据库 '{}' 中没有索引", path.display()))?;
            rtxn.commit()?;
            db
        } else {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, None)?;
            if mode == OpenMode::Clean {
                info!("清空数据库: {}", path.display());
                db.clear(&mut wtxn)?;
            }
            wtxn.commit()?;
            db
        };

        Ok(Self { env, db, read_only })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// 读取一条记录
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, key)?.map(<[u8]>::to_vec))
    }

    /// 检查记录是否存在
    pub fn exists(&self, key: &str) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.get(&rtxn, key)?.is_some())
    }

    /// 插入或覆盖一条记录
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, key, value).with_context(|| format!("写入 '{}' 失败", key))?;
        wtxn.commit()?;
        Ok(())
    }

    /// 在一个写事务中批量写入
    ///
    /// 单条记录写入失败（比如路径过长）只会跳过该记录，返回成功写入的数量
    pub fn put_many<K, V>(&self, entries: &[(K, V)]) -> Result<usize>
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
    {
        self.ensure_writable()?;
        let mut wtxn = self.env.write_txn()?;
        let mut written = 0;
        for (key, value) in entries {
            match self.db.put(&mut wtxn, key.as_ref(), value.as_ref()) {
                Ok(()) => written += 1,
                Err(e) => warn!("写入 '{}' 失败: {}", key.as_ref(), e),
            }
        }
        wtxn.commit().context("提交写事务失败")?;
        debug!("批量写入 {} / {} 条记录", written, entries.len());
        Ok(written)
    }

    /// 记录总数
    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// 开启一个读事务，在事务存活期间迭代的顺序是稳定的
    pub fn read_txn(&self) -> Result<RoTxn<'_, WithTls>> {
        Ok(self.env.read_txn()?)
    }

    /// 按键的顺序迭代所有记录，返回的数据直接借用自内存映射
    pub fn iter<'t>(
        &self,
        rtxn: &'t RoTxn<'_, WithTls>,
    ) -> Result<impl Iterator<Item = heed::Result<(&'t str, &'t [u8])>> + 't> {
        Ok(self.db.iter(rtxn)?)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            bail!("数据库以只读方式打开");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_basic_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = IndexStore::open(&path, OpenMode::Create).unwrap();

        assert!(store.is_empty().unwrap());
        assert!(!store.exists("a.jpg").unwrap());
        assert_eq!(store.get("a.jpg").unwrap(), None);

        store.put("a.jpg", b"first").unwrap();
        store.put("a.jpg", b"second").unwrap();
        assert!(store.exists("a.jpg").unwrap());
        assert_eq!(store.get("a.jpg").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_put_many_and_iter_order() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("test.db"), OpenMode::Create).unwrap();

        let entries = vec![("c", vec![3u8]), ("a", vec![1]), ("b", vec![2])];
        assert_eq!(store.put_many(&entries).unwrap(), 3);

        let rtxn = store.read_txn().unwrap();
        let items = store
            .iter(&rtxn)
            .unwrap()
            .map(|item| item.map(|(k, v)| (k.to_owned(), v.to_vec())))
            .collect::<heed::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            items,
            vec![("a".to_owned(), vec![1]), ("b".to_owned(), vec![2]), ("c".to_owned(), vec![3])]
        );
    }

    #[test]
    fn test_put_many_skips_invalid_key() {
        let dir = tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("test.db"), OpenMode::Create).unwrap();

        // lmdb 默认的键长度上限为 511 字节
        let long = "x".repeat(1024);
        let entries = vec![(long.as_str(), vec![0u8]), ("ok", vec![1])];
        assert_eq!(store.put_many(&entries).unwrap(), 1);
        assert!(store.exists("ok").unwrap());
    }

    #[test]
    fn test_persistence_and_modes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = IndexStore::open(&path, OpenMode::Create).unwrap();
            store.put("a.jpg", b"data").unwrap();
        }

        {
            let store = IndexStore::open(&path, OpenMode::ReadOnly).unwrap();
            assert!(store.is_read_only());
            assert_eq!(store.get("a.jpg").unwrap().as_deref(), Some(&b"data"[..]));
            assert!(store.put("b.jpg", b"x").is_err());
        }

        {
            let store = IndexStore::open(&path, OpenMode::Create).unwrap();
            assert_eq!(store.len().unwrap(), 1);
        }

        {
            let store = IndexStore::open(&path, OpenMode::Clean).unwrap();
            assert!(store.is_empty().unwrap());
        }
    }

    #[test]
    fn test_read_only_missing_file() {
        let dir = tempdir().unwrap();
        let result = IndexStore::open(dir.path().join("missing.db"), OpenMode::ReadOnly);
        assert!(result.is_err());
    }
}
