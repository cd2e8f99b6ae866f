use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use smallvec::SmallVec;

use crate::feature::{DESCR_LEN, Feature};

/// 树节点在 arena 中的下标
pub type NodeId = usize;

/// k-d 树节点
///
/// `features..features + n` 是该节点覆盖的特征区间，
/// 内部节点的区间起点即为分割特征，叶子节点的区间即为其中的全部特征
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub features: usize,
    pub n: usize,
    /// 分割维度
    pub ki: u32,
    /// 分割值
    pub kv: f32,
    pub leaf: bool,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
}

impl Node {
    pub fn new(features: usize, n: usize) -> Self {
        Self { features, n, ki: 0, kv: 0., leaf: false, left: None, right: None }
    }
}

/// 可遍历的树结构，内存中的 [`Tree`] 和打包后的视图都实现了它
pub trait TreeNodes {
    fn root(&self) -> Option<NodeId>;

    fn node(&self, id: NodeId) -> Node;

    /// 从根节点起可达的节点总数
    fn size(&self) -> usize {
        let mut stack: Vec<NodeId> = self.root().into_iter().collect();
        let mut count = 0;
        while let Some(id) = stack.pop() {
            count += 1;
            let node = self.node(id);
            stack.extend(node.left);
            stack.extend(node.right);
        }
        count
    }
}

/// 以 arena 方式存放的树，子节点用下标而不是指针引用
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
}

impl Tree {
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }
}

impl TreeNodes for Tree {
    fn root(&self) -> Option<NodeId> {
        self.root
    }

    fn node(&self, id: NodeId) -> Node {
        self.nodes[id]
    }
}

/// 在特征集合上建树
///
/// 实现可以原地调整特征的顺序，树中的特征下标指向调整后的顺序
pub trait TreeBuilder: Send + Sync {
    fn build(&self, features: &mut [Feature]) -> Tree;
}

/// 按方差最大的维度做中位数分割的 k-d 树
#[derive(Debug, Clone, Copy, Default)]
pub struct KdTreeBuilder;

impl TreeBuilder for KdTreeBuilder {
    fn build(&self, features: &mut [Feature]) -> Tree {
        let mut tree = Tree::default();
        if features.is_empty() {
            return tree;
        }
        let root = tree.push(Node::new(0, features.len()));
        tree.set_root(root);
        expand_subtree(&mut tree, features, root);
        tree
    }
}

fn expand_subtree(tree: &mut Tree, features: &mut [Feature], id: NodeId) {
    let Node { features: start, n, .. } = tree.node(id);
    if n <= 1 {
        tree.get_mut(id).leaf = true;
        return;
    }

    let part = &mut features[start..start + n];
    let (ki, kv) = partition_key(part);
    let node = tree.get_mut(id);
    node.ki = ki as u32;
    node.kv = kv;

    // 所有特征都落在同一侧，无法继续分割
    let j = match partition(part, ki, kv) {
        Some(j) if j < n - 1 => j,
        _ => {
            tree.get_mut(id).leaf = true;
            return;
        }
    };

    let left = tree.push(Node::new(start, j + 1));
    let right = tree.push(Node::new(start + j + 1, n - j - 1));
    let node = tree.get_mut(id);
    node.left = Some(left);
    node.right = Some(right);

    expand_subtree(tree, features, left);
    expand_subtree(tree, features, right);
}

/// 选出方差最大的维度，返回该维度和中位数
fn partition_key(features: &[Feature]) -> (usize, f32) {
    let n = features.len() as f64;
    let mut ki = 0;
    let mut var_max = -1.;
    for dim in 0..DESCR_LEN {
        let mean = features.iter().map(|f| f.descr[dim] as f64).sum::<f64>() / n;
        let var = features
            .iter()
            .map(|f| {
                let d = f.descr[dim] as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        if var > var_max {
            ki = dim;
            var_max = var;
        }
    }

    let mut values = features.iter().map(|f| f.descr[ki]).collect::<Vec<_>>();
    let k = (values.len() - 1) / 2;
    let (_, kv, _) = values.select_nth_unstable_by(k, f32::total_cmp);
    (ki, *kv)
}

/// 把 `descr[ki] <= kv` 的特征移到前面，并让分割特征位于左半部分的末尾
///
/// 返回左半部分最后一个元素的下标，左半部分为空（kv 为 NaN）时返回 None
fn partition(features: &mut [Feature], ki: usize, kv: f32) -> Option<usize> {
    let mut j = 0;
    let mut p = 0;
    for i in 0..features.len() {
        if features[i].descr[ki] <= kv {
            features.swap(j, i);
            if features[j].descr[ki] == kv {
                p = j;
            }
            j += 1;
        }
    }
    let j = j.checked_sub(1)?;
    features.swap(p, j);
    Some(j)
}

/// kNN 搜索得到的近邻
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// 近邻在特征数组中的下标
    pub index: usize,
    /// 描述符距离的平方
    pub distance: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    priority: f32,
    node: NodeId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.total_cmp(&other.priority).then(self.node.cmp(&other.node))
    }
}

/// Best-Bin-First 近似 kNN 搜索
///
/// 每探索一个叶子计一次检查，达到 `max_checks` 或没有待探索的分支时停止。
/// 返回最多 `k` 个近邻，按距离从小到大排列
pub fn bbf_knn<T: TreeNodes + ?Sized>(
    tree: &T,
    features: &[Feature],
    query: &Feature,
    k: usize,
    max_checks: usize,
) -> SmallVec<[Neighbor; 2]> {
    let mut nbrs = SmallVec::<[Neighbor; 2]>::new();
    let Some(root) = tree.root() else {
        return nbrs;
    };
    if k == 0 {
        return nbrs;
    }

    let mut queue = BinaryHeap::new();
    queue.push(Reverse(Candidate { priority: 0., node: root }));

    let mut checks = 0;
    while checks < max_checks {
        let Some(Reverse(Candidate { node, .. })) = queue.pop() else {
            break;
        };
        let leaf = explore_to_leaf(tree, node, query, &mut queue);
        for index in leaf.features..leaf.features + leaf.n {
            let distance = query.descr_dist_sq(&features[index]);
            insert_neighbor(&mut nbrs, Neighbor { index, distance }, k);
        }
        checks += 1;
    }

    nbrs
}

/// 沿查询点所在的一侧下降到叶子，另一侧以到分割面的距离为优先级入队
fn explore_to_leaf<T: TreeNodes + ?Sized>(
    tree: &T,
    start: NodeId,
    query: &Feature,
    queue: &mut BinaryHeap<Reverse<Candidate>>,
) -> Node {
    let mut node = tree.node(start);
    while !node.leaf {
        let value = query.descr[node.ki as usize];
        let (next, other) = if value <= node.kv {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };
        if let Some(other) = other {
            queue.push(Reverse(Candidate { priority: (node.kv - value).abs(), node: other }));
        }
        match next {
            Some(next) => node = tree.node(next),
            // 只有一个子节点的树，直接检查当前节点覆盖的特征
            None => break,
        }
    }
    node
}

fn insert_neighbor(nbrs: &mut SmallVec<[Neighbor; 2]>, nbr: Neighbor, k: usize) {
    if nbrs.len() == k {
        match nbrs.last() {
            Some(last) if nbr.distance < last.distance => {
                nbrs.pop();
            }
            _ => return,
        }
    }
    let pos = nbrs.partition_point(|n| n.distance <= nbr.distance);
    nbrs.insert(pos, nbr);
}
