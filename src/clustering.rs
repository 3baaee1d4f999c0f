//! Lloyd's k-means over embedding rows, used to derive centroids when the
//! corpus bundle ships without a precomputed `centroids.npy`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

const TOLERANCE: f64 = 1e-3;
const MAX_ITERS: usize = 100;

/// Cluster count convention for an `n`-document corpus: `ceil(sqrt(n))`.
pub fn cluster_count(n: usize) -> usize {
    let k = (n as f64).sqrt().ceil() as usize;
    k.clamp(1, n.max(1))
}

/// Runs k-means until the centroids move less than the tolerance. `k` must
/// not exceed the number of samples; an empty cluster keeps its previous
/// centroid rather than collapsing to the origin.
pub fn kmeans<R: Rng + ?Sized>(data: ArrayView2<f64>, k: usize, rng: &mut R) -> Array2<f64> {
    let n_samples = data.nrows();
    let n_features = data.ncols();
    if n_samples == 0 || k == 0 {
        return Array2::zeros((0, n_features));
    }
    assert!(k <= n_samples, "more clusters than samples");

    let seeds = rand::seq::index::sample(rng, n_samples, k).into_vec();
    let mut centroids = data.select(Axis(0), &seeds);

    for _ in 0..MAX_ITERS {
        let memberships: Vec<usize> = data
            .axis_iter(Axis(0))
            .map(|sample| nearest_row(centroids.view(), sample))
            .collect();

        let mut sums = Array2::<f64>::zeros((k, n_features));
        let mut counts = vec![0usize; k];
        for (sample, &cluster) in data.axis_iter(Axis(0)).zip(&memberships) {
            sums.row_mut(cluster).scaled_add(1.0, &sample);
            counts[cluster] += 1;
        }

        let mut next = centroids.clone();
        for (cluster, count) in counts.iter().enumerate() {
            if *count > 0 {
                next.row_mut(cluster)
                    .assign(&(&sums.row(cluster) / *count as f64));
            }
        }

        let movement = (&centroids - &next).mapv(|x| x * x).sum().sqrt();
        centroids = next;
        if movement < TOLERANCE {
            break;
        }
    }

    centroids
}

/// Index of the row of `rows` closest to `point` in squared L2 distance.
pub fn nearest_row(rows: ArrayView2<f64>, point: ArrayView1<f64>) -> usize {
    let mut closest = 0;
    let mut min_distance = f64::INFINITY;
    for (i, row) in rows.axis_iter(Axis(0)).enumerate() {
        let diff: Array1<f64> = &row - &point;
        let distance = diff.dot(&diff);
        if distance < min_distance {
            min_distance = distance;
            closest = i;
        }
    }
    closest
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn cluster_count_convention() {
        assert_eq!(cluster_count(0), 1);
        assert_eq!(cluster_count(1), 1);
        assert_eq!(cluster_count(4), 2);
        assert_eq!(cluster_count(10), 4);
    }

    #[test]
    fn separated_blobs_find_their_centres() {
        let data = array![
            [0.0, 0.1],
            [0.1, 0.0],
            [0.0, 0.0],
            [10.0, 10.1],
            [10.1, 10.0],
            [10.0, 10.0],
        ];
        let mut rng = StdRng::seed_from_u64(9);
        let centroids = kmeans(data.view(), 2, &mut rng);
        assert_eq!(centroids.nrows(), 2);

        let low = nearest_row(centroids.view(), array![0.0, 0.0].view());
        let high = nearest_row(centroids.view(), array![10.0, 10.0].view());
        assert_ne!(low, high);
        for &v in centroids.row(low).iter() {
            assert_abs_diff_eq!(v, 0.033, epsilon = 0.05);
        }
        for &v in centroids.row(high).iter() {
            assert_abs_diff_eq!(v, 10.033, epsilon = 0.05);
        }
    }

    #[test]
    fn every_point_its_own_cluster() {
        let data = array![[1.0, 2.0], [5.0, 6.0]];
        let mut rng = StdRng::seed_from_u64(3);
        let centroids = kmeans(data.view(), 2, &mut rng);
        let a = nearest_row(centroids.view(), data.row(0));
        let b = nearest_row(centroids.view(), data.row(1));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_input_yields_no_centroids() {
        let data = Array2::<f64>::zeros((0, 3));
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(kmeans(data.view(), 0, &mut rng).nrows(), 0);
    }
}
