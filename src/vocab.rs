use log::{debug, info};
use ndarray::{ArrayView1, ArrayView2};
use rand::{distributions::WeightedIndex, prelude::Distribution, seq::SliceRandom, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, ToSmallVec};
use std::fmt;

use crate::*;

/// Lloyd iterations per k-means step before giving up on convergence.
const MAX_KMEANS_ITERATIONS: usize = 100;

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Feature vocabulary built from a collection of image keypoint descriptors. Can be:
/// 1. Created.
/// 2. Saved to a file & loaded from a file (requires bincode feature, enabled by default).
/// 3. Used to transform a new set of descriptors into a BoW representation (and
///    optionally get DirectIndex from features to nodes).
pub struct Vocabulary<const L: usize> {
    blocks: Vec<Block<L>>,
    k: usize,
    dim: usize,
    num_blocks: usize,
    num_leaves: usize,
}

/// Vocabulary API
impl<const L: usize> Vocabulary<{ L }> {
    /// Transform descriptor rows into their bag of words representation with
    /// respect to the Vocabulary. Result is l1 normalized.
    pub fn transform(&self, features: ArrayView2<f32>) -> BowResult<BoW> {
        self.transform_generic(features, false).map(|(bow, _)| bow)
    }

    /// Transform descriptor rows into their bag of words representation with
    /// respect to the Vocabulary. Result is l1 normalized.
    ///
    /// Also provides "direct index" from the features to their corresponding nodes in the Vocabulary tree.
    ///
    /// The direct index for `feature[i]` is `di = DirectIdx[i]` where
    /// `di.len() <= l` (number of levels), and `di[j]` is the id of the node matching `feature[i]`
    /// at level `j` in the Vocabulary tree.
    pub fn transform_with_direct_idx(
        &self,
        features: ArrayView2<f32>,
    ) -> BowResult<(BoW, DirectIdx<L>)> {
        self.transform_generic(features, true)
    }

    /// Build a vocabulary from a collection of descriptors.
    ///
    /// Args: (k: Branching factor). The number of levels is `L`.
    pub fn create(features: ArrayView2<f32>, k: usize) -> BowResult<Self> {
        Self::create_with_rng(features, k, &mut thread_rng())
    }

    /// Same as [`Vocabulary::create`] with a caller supplied source of randomness
    /// for the k-means seeding.
    pub fn create_with_rng<R: Rng + ?Sized>(
        features: ArrayView2<f32>,
        k: usize,
        rng: &mut R,
    ) -> BowResult<Self> {
        if k < 2 {
            return Err(BowErr::Config(format!("branching factor must be at least 2, got {}", k)));
        }
        if L == 0 {
            return Err(BowErr::Config("vocabulary needs at least one level".into()));
        }
        if features.nrows() == 0 {
            return Err(BowErr::EmptyBatch);
        }

        // Start with root of tree
        let mut v = Self::empty(k, features.ncols());

        // Build with recursive k-means clustering of features
        let all: Vec<usize> = (0..features.nrows()).collect();
        v.cluster(features, &all, vec![0], 1, rng);

        // Sort by block id
        v.blocks.sort_by(|a, b| a.id.get_bid().cmp(&b.id.get_bid()));

        info!(
            "Created vocabulary with {} words from {} features",
            v.num_leaves,
            features.nrows()
        );
        Ok(v)
    }

    /// Number of words (leaves), the length of every BoW.
    pub fn num_words(&self) -> usize {
        self.num_leaves
    }

    /// Width of the descriptors this vocabulary was built from.
    pub fn descriptor_width(&self) -> usize {
        self.dim
    }

    /// Load an ABoW vocabulary from a file
    #[cfg(feature = "bincode")]
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> BowResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        Ok(bincode::deserialize(&buffer)?)
    }

    /// Save vocabulary to a file
    #[cfg(feature = "bincode")]
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> BowResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
/// A unit representing a non-leaf node in the vocabulary
struct Block<const L: usize> {
    id: NodeId<L>,
    children: Children<L>,
}

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Data structure representing the child nodes of a block, which may
/// or may not be leaves
struct Children<const L: usize> {
    features: Vec<Desc>,
    weights: Vec<f32>,
    cluster_size: Vec<usize>,
    ids: Vec<NodeId<L>>,
}

#[derive(Debug, Clone, PartialEq)]
/// Unique identifier for a node. The Leaf variant stores ids of all its parents,
/// which is equivalent to the DirectIndex for any feature matching that leaf.
enum NodeId<const L: usize> {
    Block(usize),
    Leaf(SmallVec<[usize; L]>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Serialized form of [`NodeId`]; smallvec's inline capacity is not part of the format.
enum SerializableNodeId {
    Block(usize),
    Leaf(Vec<usize>),
}

impl<const L: usize> Serialize for NodeId<{ L }> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let ser = match self {
            NodeId::Block(id) => SerializableNodeId::Block(*id),
            NodeId::Leaf(l_id) => SerializableNodeId::Leaf(l_id.to_vec()),
        };

        ser.serialize(serializer)
    }
}
impl<'de, const L: usize> Deserialize<'de> for NodeId<{ L }> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let ser = SerializableNodeId::deserialize(deserializer)?;

        Ok(match ser {
            SerializableNodeId::Block(id) => NodeId::Block(id),
            SerializableNodeId::Leaf(l_id) => NodeId::Leaf(l_id.to_smallvec()),
        })
    }
}

impl<const L: usize> Vocabulary<{ L }> {
    fn transform_generic(
        &self,
        features: ArrayView2<f32>,
        di: bool,
    ) -> BowResult<(BoW, DirectIdx<L>)> {
        if features.ncols() != self.dim {
            return Err(BowErr::DescriptorWidth {
                expected: self.dim,
                found: features.ncols(),
            });
        }
        let mut bow: BoW = vec![0.; self.num_leaves];
        let mut direct_idx: DirectIdx<L> = Vec::with_capacity(features.nrows());
        for feature in features.rows() {
            // start at root block
            let mut block = &self.blocks[0];

            // traverse tree
            loop {
                let best_child = Self::nearest(feature, &block.children.features);
                match &block.children.ids[best_child] {
                    NodeId::Block(id) => {
                        block = &self.blocks[*id];
                    }
                    NodeId::Leaf(ids) => {
                        if di {
                            // add word parent ids to direct index
                            direct_idx.push(ids.clone());
                        }
                        // add word/leaf id and weight to result
                        if let Some(&word_id) = ids.last() {
                            bow[word_id] += block.children.weights[best_child];
                        }
                        break;
                    }
                }
            }
        }
        // Normalize BoW vector
        let sum: f32 = bow.iter().sum();
        if sum > 0. {
            let inv_sum = 1. / sum;
            for w in bow.iter_mut() {
                *w *= inv_sum;
            }
        }

        Ok((bow, direct_idx))
    }

    fn cluster<R: Rng + ?Sized>(
        &mut self,
        features: ArrayView2<f32>,
        members: &[usize],
        parent_ids: Vec<usize>,
        curr_level: usize,
        rng: &mut R,
    ) {
        debug!(
            "KMeans step with {} features. parents: {:?}, level {}",
            members.len(),
            parent_ids,
            curr_level
        );
        if members.is_empty() {
            return;
        }
        let mut clusters: Vec<Desc>;
        let mut groups: Vec<Vec<usize>>;

        if members.len() <= self.k {
            // Only one feature per cluster
            clusters = members.iter().map(|&i| features.row(i).to_vec()).collect();
            groups = members.iter().map(|&i| vec![i]).collect();
        } else {
            // Proceed with kmeans clustering
            clusters = Self::initialize_clusters(features, members, self.k, rng);
            groups = vec![Vec::new(); self.k];

            for _ in 0..MAX_KMEANS_ITERATIONS {
                let mut new_groups: Vec<Vec<usize>> = vec![Vec::new(); self.k];
                for &i in members {
                    new_groups[Self::nearest(features.row(i), &clusters)].push(i);
                }

                if groups == new_groups {
                    break; // converged
                }

                // update clusters, empty ones keep their centre
                for (centre, group) in clusters.iter_mut().zip(new_groups.iter()) {
                    if !group.is_empty() {
                        *centre = Self::desc_mean(features, group);
                    }
                }
                groups = new_groups;
            }
        }

        // Create block
        let ids: Vec<_> = groups
            .iter()
            .map(|g| self.next_node_id(curr_level == L || g.len() <= 1, &parent_ids))
            .collect();

        let children = Children {
            weights: vec![1.; groups.len()],
            ids: ids.clone(),
            cluster_size: groups.iter().map(|g| g.len()).collect(),
            features: clusters,
        };
        let block = Block {
            id: NodeId::Block(*parent_ids.last().unwrap_or(&0)),
            children,
        };
        self.blocks.push(block);

        // Recurse
        if curr_level < L {
            for (id, group) in ids.iter().zip(groups.iter()) {
                if let NodeId::Block(bid) = id {
                    // update parent ids
                    let mut ids = parent_ids.clone();
                    ids.push(*bid);

                    // cluster on child cluster
                    self.cluster(features, group, ids, curr_level + 1, rng);
                }
            }
        }
    }

    /// Initialize clusters for kmeans with k-means++ seeding.
    fn initialize_clusters<R: Rng + ?Sized>(
        features: ArrayView2<f32>,
        members: &[usize],
        k: usize,
        rng: &mut R,
    ) -> Vec<Desc> {
        let mut centres: Vec<Desc> = Vec::with_capacity(k);
        let first = *members.choose(rng).unwrap_or(&members[0]);
        centres.push(features.row(first).to_vec());

        let mut dist: Vec<f32> = members
            .iter()
            .map(|&i| Self::sq_distance(features.row(i), &centres[0]))
            .collect();
        while centres.len() < k {
            let next = match WeightedIndex::new(&dist) {
                Ok(w) => members[w.sample(rng)],
                // every remaining feature sits on a centre
                Err(_) => members[rng.gen_range(0..members.len())],
            };
            let centre = features.row(next).to_vec();
            for (d, &i) in dist.iter_mut().zip(members) {
                *d = d.min(Self::sq_distance(features.row(i), &centre));
            }
            centres.push(centre);
        }
        centres
    }

    #[inline]
    /// Compute the mean of a group of descriptor rows.
    fn desc_mean(features: ArrayView2<f32>, group: &[usize]) -> Desc {
        let mut mean = vec![0f32; features.ncols()];
        for &i in group {
            for (m, v) in mean.iter_mut().zip(features.row(i)) {
                *m += v;
            }
        }
        let inv = 1. / group.len() as f32;
        mean.iter_mut().for_each(|m| *m *= inv);
        mean
    }

    #[inline]
    /// Squared euclidean distance between two descriptors.
    fn sq_distance(x: ArrayView1<f32>, y: &[f32]) -> f32 {
        x.iter().zip(y).fold(0., |a, (b, c)| a + (b - c) * (b - c))
    }

    #[inline]
    /// Index of the centre closest to `feature`.
    fn nearest(feature: ArrayView1<f32>, centres: &[Desc]) -> usize {
        let mut best: (usize, f32) = (0, f32::MAX);
        for (j, c) in centres.iter().enumerate() {
            let d = Self::sq_distance(feature, c);
            if d < best.1 {
                best = (j, d);
            }
        }
        best.0
    }

    /// Provide the next NodeId, either leaf/word or block.
    fn next_node_id(&mut self, leaf: bool, parent_ids: &[usize]) -> NodeId<L> {
        match leaf {
            true => {
                // Leaf node will hold the block ids of its parents in addition to leaf id, to facilitate getting direct index later
                let mut new_parent_ids: SmallVec<[usize; L]> = parent_ids[1..].to_smallvec(); // Clone ids but drop the first parent which is always 0
                new_parent_ids.push(self.num_leaves); // Add leaf id
                self.num_leaves += 1;
                NodeId::Leaf(new_parent_ids)
            }
            false => {
                self.num_blocks += 1;
                NodeId::Block(self.num_blocks)
            }
        }
    }

    fn empty(k: usize, dim: usize) -> Self {
        Self {
            blocks: Vec::new(),
            k,
            dim,
            num_blocks: 0,
            num_leaves: 0,
        }
    }
}

impl<const L: usize> NodeId<L> {
    fn get_bid(&self) -> usize {
        match self {
            NodeId::Block(i) => *i,
            NodeId::Leaf(_) => unreachable!(),
        }
    }
}

impl<const L: usize> fmt::Debug for Children<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Children")
            .field("ids", &self.ids)
            .field("weights", &self.weights)
            .field("cluster size", &self.cluster_size)
            .finish()
    }
}

impl<const L: usize> fmt::Debug for Vocabulary<{ L }> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut clust_sizes: Vec<usize> = Vec::new();
        for b in self.blocks.iter() {
            for (i, &c) in b.children.cluster_size.iter().enumerate() {
                if matches!(b.children.ids[i], NodeId::Leaf(_)) {
                    clust_sizes.push(c);
                }
            }
        }
        let sum = clust_sizes.iter().sum::<usize>();
        f.debug_struct("Vocabulary")
            .field("Word/Leaf Nodes", &self.num_leaves)
            .field("Other Nodes", &self.num_blocks)
            .field("Levels", &L)
            .field("Branching Factor", &self.k)
            .field("Descriptor Width", &self.dim)
            .field("Total Training Features", &sum)
            .field("Min Word Cluster Size", &clust_sizes.iter().min())
            .field("Max Word Cluster Size", &clust_sizes.iter().max())
            .field("Mean Word Cluster Size", &(sum / clust_sizes.len().max(1)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};
    use rand::{rngs::StdRng, SeedableRng};

    /// Four tight 2-d clusters around the corners of a square.
    fn corners() -> Array2<f32> {
        let mut rows = Vec::new();
        for (cx, cy) in [(0., 0.), (10., 0.), (0., 10.), (10., 10.)] {
            for j in 0..5 {
                let e = j as f32 * 0.1;
                rows.extend_from_slice(&[cx + e, cy - e]);
            }
        }
        Array2::from_shape_vec((20, 2), rows).unwrap()
    }

    #[test]
    fn single_level_vocabulary_groups_corners() {
        let feats = corners();
        let mut rng = StdRng::seed_from_u64(7);
        let voc = Vocabulary::<1>::create_with_rng(feats.view(), 4, &mut rng).unwrap();
        assert_eq!(voc.num_words(), 4);

        // All points of one corner map to one word
        let bow = voc.transform(feats.slice(ndarray::s![0..5, ..])).unwrap();
        assert_eq!(bow.iter().filter(|w| **w > 0.).count(), 1);
        assert_relative_eq!(bow.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn direct_index_has_one_entry_per_feature() {
        let feats = corners();
        let mut rng = StdRng::seed_from_u64(1);
        let voc = Vocabulary::<2>::create_with_rng(feats.view(), 2, &mut rng).unwrap();
        let (bow, di) = voc.transform_with_direct_idx(feats.view()).unwrap();
        assert_eq!(di.len(), 20);
        assert_eq!(bow.len(), voc.num_words());
        assert!(di.iter().all(|path| !path.is_empty() && path.len() <= 2));
    }

    #[test]
    fn identical_sets_score_one() {
        let feats = corners();
        let mut rng = StdRng::seed_from_u64(3);
        let voc = Vocabulary::<2>::create_with_rng(feats.view(), 3, &mut rng).unwrap();
        let a = voc.transform(feats.view()).unwrap();
        let b = voc.transform(feats.view()).unwrap();
        assert_relative_eq!(a.l1(&b), 1.0);
    }

    #[test]
    fn fewer_features_than_k() {
        let feats = array![[0., 1.], [2., 3.]];
        let voc = Vocabulary::<3>::create(feats.view(), 5).unwrap();
        assert_eq!(voc.num_words(), 2);
    }

    #[test]
    fn width_mismatch_is_reported() {
        let feats = corners();
        let voc = Vocabulary::<1>::create(feats.view(), 4).unwrap();
        let wrong = Array2::<f32>::zeros((3, 5));
        assert!(matches!(
            voc.transform(wrong.view()),
            Err(BowErr::DescriptorWidth { expected: 2, found: 5 })
        ));
    }

    #[test]
    fn invalid_arguments() {
        let empty = Array2::<f32>::zeros((0, 2));
        assert!(matches!(
            Vocabulary::<1>::create(empty.view(), 4),
            Err(BowErr::EmptyBatch)
        ));
        assert!(matches!(
            Vocabulary::<1>::create(corners().view(), 1),
            Err(BowErr::Config(_))
        ));
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.voc");
        let voc = Vocabulary::<2>::create(corners().view(), 3).unwrap();
        voc.save(&path).unwrap();
        let loaded = Vocabulary::<2>::load(&path).unwrap();
        assert_eq!(voc, loaded);
    }
}
