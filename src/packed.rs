//! 特征和 k-d 树的打包格式
//!
//! 一条记录由三段连续的数据组成：
//!
//! ```text
//! | feature_count: u32 | node_count: u32 | Feature * feature_count | PackedNode * node_count |
//! ```
//!
//! 节点按先序排列：节点本身，然后是整棵左子树，然后是整棵右子树。
//! 节点中的特征引用是相对特征数组起点的字节偏移，左右子节点是相对根节点的字节偏移，
//! 0 表示没有子节点（根节点不可能是任何节点的子节点）。
//! 整条记录与所在地址无关，所有字段均为本机字节序。

use std::borrow::Cow;

use anyhow::{Result, bail, ensure};
use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, NativeEndian};

use crate::feature::{DESCR_LEN, Feature};
use crate::kdtree::{Node, NodeId, Tree, TreeNodes};

/// 头部大小
pub const HEADER_SIZE: usize = 8;
/// 单个特征记录的大小
pub const FEATURE_SIZE: usize = size_of::<Feature>();
/// 单个节点记录的大小
pub const NODE_SIZE: usize = size_of::<PackedNode>();

/// 打包记录的头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub feature_count: u32,
    pub node_count: u32,
}

impl Header {
    /// 头部描述的记录总长度
    pub fn record_len(&self) -> usize {
        HEADER_SIZE
            + self.feature_count as usize * FEATURE_SIZE
            + self.node_count as usize * NODE_SIZE
    }
}

/// 打包后的节点
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedNode {
    /// 节点特征区间起点相对特征数组的字节偏移
    pub features: u64,
    /// 特征区间长度
    pub n: u32,
    pub ki: u32,
    pub kv: f32,
    pub leaf: u32,
    /// 左子节点相对根节点的字节偏移，0 表示不存在
    pub left: u64,
    /// 右子节点相对根节点的字节偏移，0 表示不存在
    pub right: u64,
}

/// 把特征数组和树打包成一段连续的字节
///
/// `tree` 中的特征下标必须指向 `features`
pub fn pack<T: TreeNodes + ?Sized>(features: &[Feature], tree: &T) -> Vec<u8> {
    let node_count = tree.size();

    // 全部置零，缺失的子节点自然就是 0
    let mut nodes = vec![PackedNode::zeroed(); node_count];
    if let Some(root) = tree.root() {
        let mut cursor = 0;
        copy_nodes(tree, root, &mut nodes, &mut cursor);
        debug_assert_eq!(cursor + 1, node_count);
    }

    let header = Header { feature_count: features.len() as u32, node_count: node_count as u32 };
    let mut data = Vec::with_capacity(header.record_len());
    data.extend_from_slice(&header.feature_count.to_ne_bytes());
    data.extend_from_slice(&header.node_count.to_ne_bytes());
    data.extend_from_slice(bytemuck::cast_slice(features));
    data.extend_from_slice(bytemuck::cast_slice(&nodes));
    data
}

/// 先序写入 `id` 为根的子树，`cursor` 指向当前节点所在的槽位，返回时指向最后写入的槽位
fn copy_nodes<T: TreeNodes + ?Sized>(
    tree: &T,
    id: NodeId,
    nodes: &mut [PackedNode],
    cursor: &mut usize,
) {
    let node = tree.node(id);
    let this = *cursor;
    nodes[this] = PackedNode {
        features: (node.features * FEATURE_SIZE) as u64,
        n: node.n as u32,
        ki: node.ki,
        kv: node.kv,
        leaf: node.leaf as u32,
        left: 0,
        right: 0,
    };

    // 左子树紧跟在当前节点之后
    if let Some(left) = node.left {
        *cursor += 1;
        nodes[this].left = (*cursor * NODE_SIZE) as u64;
        copy_nodes(tree, left, nodes, cursor);
    }

    // 右子树紧跟在整棵左子树之后
    if let Some(right) = node.right {
        *cursor += 1;
        nodes[this].right = (*cursor * NODE_SIZE) as u64;
        copy_nodes(tree, right, nodes, cursor);
    }
}

/// 读取记录头部
pub fn read_header(data: &[u8]) -> Result<Header> {
    ensure!(data.len() >= HEADER_SIZE, "记录长度不足: {} 字节", data.len());
    Ok(Header {
        feature_count: NativeEndian::read_u32(&data[0..4]),
        node_count: NativeEndian::read_u32(&data[4..8]),
    })
}

/// 解包后的记录
///
/// 对齐满足要求时直接借用输入的字节，否则复制一份
#[derive(Debug, Clone)]
pub struct Packed<'a> {
    features: Cow<'a, [Feature]>,
    nodes: Cow<'a, [PackedNode]>,
}

/// 解包 [`pack`] 生成的记录
///
/// 会检查长度和所有偏移量，损坏的记录返回错误而不是产生越界访问
pub fn unpack(data: &[u8]) -> Result<Packed<'_>> {
    let header = read_header(data)?;
    ensure!(
        data.len() == header.record_len(),
        "记录长度不匹配: 头部为 {} 个特征 {} 个节点，需要 {} 字节，实际 {} 字节",
        header.feature_count,
        header.node_count,
        header.record_len(),
        data.len()
    );

    let split = HEADER_SIZE + header.feature_count as usize * FEATURE_SIZE;
    let packed = Packed {
        features: cast_or_copy(&data[HEADER_SIZE..split]),
        nodes: cast_or_copy(&data[split..]),
    };
    packed.validate()?;
    Ok(packed)
}

/// 数据库不保证返回的数据是对齐的，不对齐时只能复制
fn cast_or_copy<T: Pod>(bytes: &[u8]) -> Cow<'_, [T]> {
    match bytemuck::try_cast_slice(bytes) {
        Ok(slice) => Cow::Borrowed(slice),
        Err(_) => Cow::Owned(bytemuck::pod_collect_to_vec(bytes)),
    }
}

impl Packed<'_> {
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn nodes(&self) -> &[PackedNode] {
        &self.nodes
    }

    /// 数据是否直接借用自输入
    pub fn is_borrowed(&self) -> bool {
        matches!((&self.features, &self.nodes), (Cow::Borrowed(_), Cow::Borrowed(_)))
    }

    /// 转换为独立的内存树
    pub fn to_tree(&self) -> Tree {
        let mut tree = Tree::default();
        for id in 0..self.nodes.len() {
            tree.push(self.node(id));
        }
        if let Some(root) = self.root() {
            tree.set_root(root);
        }
        tree
    }

    fn validate(&self) -> Result<()> {
        let feature_count = self.features.len();
        let node_count = self.nodes.len();

        for (i, node) in self.nodes.iter().enumerate() {
            let offset = node.features as usize;
            if offset % FEATURE_SIZE != 0 {
                bail!("节点 {} 的特征偏移 {} 未对齐", i, offset);
            }
            let start = offset / FEATURE_SIZE;
            if start.checked_add(node.n as usize).is_none_or(|end| end > feature_count) {
                bail!("节点 {} 的特征区间 {}+{} 超出 {} 个特征", i, start, node.n, feature_count);
            }
            if node.leaf == 0 && node.ki as usize >= DESCR_LEN {
                bail!("节点 {} 的分割维度 {} 无效", i, node.ki);
            }
            for child in [node.left, node.right] {
                if child == 0 {
                    continue;
                }
                let child = child as usize;
                if child % NODE_SIZE != 0 {
                    bail!("节点 {} 的子节点偏移 {} 未对齐", i, child);
                }
                // 先序排列下子节点总是位于父节点之后
                let index = child / NODE_SIZE;
                if index <= i || index >= node_count {
                    bail!("节点 {} 的子节点 {} 超出范围", i, index);
                }
            }
        }
        Ok(())
    }
}

impl TreeNodes for Packed<'_> {
    fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(0)
    }

    fn node(&self, id: NodeId) -> Node {
        let node = &self.nodes[id];
        let child = |offset: u64| (offset != 0).then(|| offset as usize / NODE_SIZE);
        Node {
            features: node.features as usize / FEATURE_SIZE,
            n: node.n as usize,
            ki: node.ki,
            kv: node.kv,
            leaf: node.leaf != 0,
            left: child(node.left),
            right: child(node.right),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::kdtree::{KdTreeBuilder, TreeBuilder};

    fn feature(v: f32) -> Feature {
        let mut descr = [0f32; DESCR_LEN];
        descr[0] = v;
        descr[1] = -v;
        Feature { x: v, y: 2. * v, scale: 1.5, orientation: 0.25, descr }
    }

    fn random_features(n: usize, seed: u64) -> Vec<Feature> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut descr = [0f32; DESCR_LEN];
                descr.iter_mut().for_each(|v| *v = rng.random_range(0.0..1.0));
                Feature::from_descr(descr)
            })
            .collect()
    }

    /// 4 个特征上的平衡树：根节点覆盖全部，左右叶子各覆盖 2 个
    fn balanced_tree() -> (Vec<Feature>, Tree) {
        let features = (0..4).map(|i| feature(i as f32)).collect::<Vec<_>>();
        let mut tree = Tree::default();
        // 故意打乱 arena 中的顺序，打包后仍应为先序
        let right = tree.push(Node { leaf: true, ..Node::new(2, 2) });
        let left = tree.push(Node { leaf: true, ..Node::new(0, 2) });
        let root = tree.push(Node {
            ki: 0,
            kv: 1.,
            left: Some(left),
            right: Some(right),
            ..Node::new(0, 4)
        });
        tree.set_root(root);
        (features, tree)
    }

    /// 同时遍历两棵树，比较结构和节点上的特征
    fn assert_isomorphic<A: TreeNodes, B: TreeNodes>(
        fa: &[Feature],
        a: &A,
        fb: &[Feature],
        b: &B,
    ) {
        let mut stack = vec![(a.root(), b.root())];
        while let Some(pair) = stack.pop() {
            let (ia, ib) = match pair {
                (None, None) => continue,
                (Some(ia), Some(ib)) => (ia, ib),
                _ => panic!("tree shape mismatch"),
            };
            let (na, nb) = (a.node(ia), b.node(ib));
            assert_eq!((na.n, na.ki, na.kv, na.leaf), (nb.n, nb.ki, nb.kv, nb.leaf));
            assert_eq!(&fa[na.features..na.features + na.n], &fb[nb.features..nb.features + nb.n]);
            stack.push((na.left, nb.left));
            stack.push((na.right, nb.right));
        }
    }

    #[test]
    fn test_pack_header() {
        let (features, tree) = balanced_tree();
        let data = pack(&features, &tree);
        let header = read_header(&data).unwrap();
        assert_eq!(header, Header { feature_count: 4, node_count: 3 });
        assert_eq!(data.len(), HEADER_SIZE + 4 * FEATURE_SIZE + 3 * NODE_SIZE);
        assert_eq!(NODE_SIZE, 40);
        assert_eq!(data[0..4], 4u32.to_ne_bytes());
        assert_eq!(data[4..8], 3u32.to_ne_bytes());
    }

    #[test]
    fn test_pack_preorder_layout() {
        let (features, tree) = balanced_tree();
        let data = pack(&features, &tree);
        let packed = unpack(&data).unwrap();
        let nodes = packed.nodes();

        // 根节点位于下标 0，左子树紧随其后，然后是右子树
        assert_eq!(nodes[0].n, 4);
        assert_eq!(nodes[0].left, NODE_SIZE as u64);
        assert_eq!(nodes[0].right, 2 * NODE_SIZE as u64);
        assert_eq!((nodes[1].features, nodes[1].n), (0, 2));
        assert_eq!((nodes[2].features, nodes[2].n), (2 * FEATURE_SIZE as u64, 2));
        assert_eq!((nodes[1].left, nodes[1].right), (0, 0));
    }

    #[test]
    fn test_pack_preorder_deep_left() {
        let features = vec![feature(0.)];
        // root -> left(a -> left(b)), root -> right(c)
        let mut tree = Tree::default();
        let b = tree.push(Node { leaf: true, ..Node::new(0, 1) });
        let a = tree.push(Node { left: Some(b), ..Node::new(0, 1) });
        let c = tree.push(Node { leaf: true, ..Node::new(0, 1) });
        let root = tree.push(Node { left: Some(a), right: Some(c), ..Node::new(0, 1) });
        tree.set_root(root);

        let data = pack(&features, &tree);
        let packed = unpack(&data).unwrap();
        let nodes = packed.nodes();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].left, NODE_SIZE as u64);
        assert_eq!(nodes[1].left, 2 * NODE_SIZE as u64);
        assert_eq!(nodes[1].right, 0);
        // 右子节点在整棵左子树之后
        assert_eq!(nodes[0].right, 3 * NODE_SIZE as u64);
        assert_isomorphic(&features, &tree, packed.features(), &packed);
    }

    #[test]
    fn test_round_trip_kdtree() {
        for (n, seed) in [(1, 0), (2, 1), (7, 2), (100, 3), (513, 4)] {
            let mut features = random_features(n, seed);
            let tree = KdTreeBuilder.build(&mut features);
            let data = pack(&features, &tree);
            let packed = unpack(&data).unwrap();

            assert_eq!(packed.features(), &features[..]);
            assert_eq!(packed.size(), tree.size());
            assert_isomorphic(&features, &tree, packed.features(), &packed);
        }
    }

    #[test]
    fn test_round_trip_empty() {
        let data = pack(&[], &Tree::default());
        assert_eq!(read_header(&data).unwrap(), Header { feature_count: 0, node_count: 0 });
        let packed = unpack(&data).unwrap();
        assert!(packed.features().is_empty());
        assert_eq!(packed.root(), None);
    }

    #[test]
    fn test_offsets_in_bounds() {
        let mut features = random_features(300, 9);
        let tree = KdTreeBuilder.build(&mut features);
        let data = pack(&features, &tree);
        let packed = unpack(&data).unwrap();
        let nodes_len = (packed.nodes().len() * NODE_SIZE) as u64;
        let features_len = (packed.features().len() * FEATURE_SIZE) as u64;
        for node in packed.nodes() {
            assert!(node.features + node.n as u64 * FEATURE_SIZE as u64 <= features_len);
            assert!(node.left < nodes_len && node.right < nodes_len);
        }
    }

    #[test]
    fn test_unpack_unaligned() {
        let (features, tree) = balanced_tree();
        let data = pack(&features, &tree);
        // 错开一个字节，强制走复制的分支
        let mut shifted = vec![0u8; data.len() + 1];
        shifted[1..].copy_from_slice(&data);
        let packed = unpack(&shifted[1..]).unwrap();
        assert!(!packed.is_borrowed());
        assert_isomorphic(&features, &tree, packed.features(), &packed);
    }

    #[test]
    fn test_to_tree() {
        let (features, tree) = balanced_tree();
        let data = pack(&features, &tree);
        let packed = unpack(&data).unwrap();
        let restored = packed.to_tree();
        assert_isomorphic(&features, &tree, packed.features(), &restored);
    }

    #[test]
    fn test_unpack_truncated() {
        let (features, tree) = balanced_tree();
        let data = pack(&features, &tree);
        assert!(unpack(&data[..4]).is_err());
        assert!(unpack(&data[..data.len() - 1]).is_err());
    }

    #[test]
    fn test_unpack_bad_child_offset() {
        let (features, tree) = balanced_tree();
        let mut data = pack(&features, &tree);
        let root = HEADER_SIZE + 4 * FEATURE_SIZE;

        // 去掉子节点仍然是合法的记录
        let mut node: PackedNode = bytemuck::pod_read_unaligned(&data[root..root + NODE_SIZE]);
        node.right = 0;
        node.left = 0;
        data[root..root + NODE_SIZE].copy_from_slice(bytemuck::bytes_of(&node));
        assert!(unpack(&data).is_ok());

        // 越过节点数组末尾
        node.left = NODE_SIZE as u64 * 3;
        data[root..root + NODE_SIZE].copy_from_slice(bytemuck::bytes_of(&node));
        let err = unpack(&data).unwrap_err();
        assert!(err.to_string().contains("超出范围"));

        // 没有对齐到节点边界
        node.left = 7;
        data[root..root + NODE_SIZE].copy_from_slice(bytemuck::bytes_of(&node));
        assert!(unpack(&data).is_err());
    }

    #[test]
    fn test_unpack_bad_feature_range() {
        let (features, tree) = balanced_tree();
        let mut data = pack(&features, &tree);
        let leaf = HEADER_SIZE + 4 * FEATURE_SIZE + 2 * NODE_SIZE;
        let mut node: PackedNode = bytemuck::pod_read_unaligned(&data[leaf..leaf + NODE_SIZE]);
        node.n = 3;
        data[leaf..leaf + NODE_SIZE].copy_from_slice(bytemuck::bytes_of(&node));
        assert!(unpack(&data).is_err());
    }
}
