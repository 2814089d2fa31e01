use rayon::prelude::*;

/// wraps a signed 2-D coordinate into the array and returns its row-major linear index
fn coord_to_row_maj_index(coord: [i64; 2], dims: [usize; 2]) -> usize {
    let r = coord[0].rem_euclid(dims[0] as i64) as usize;
    let c = coord[1].rem_euclid(dims[1] as i64) as usize;
    r * dims[1] + c
}

fn row_maj_index_to_coord(idx: usize, dims: [usize; 2]) -> [i64; 2] {
    [(idx / dims[1]) as i64, (idx % dims[1]) as i64]
}

/// circularly shifts a row-major 2-D array by `shift` samples along each axis. A positive shift
/// moves data towards higher indices, matching numpy's `roll`.
pub fn circshift2<T: Copy + Send + Sync>(dims: [usize; 2], shift: [i64; 2], data: &mut [T]) {
    assert_eq!(dims[0] * dims[1], data.len(), "dims and source size must agree");
    if data.is_empty() {
        return;
    }
    let result = (0..data.len())
        .into_par_iter()
        .map(|final_idx| {
            let mut coord = row_maj_index_to_coord(final_idx, dims);
            // reverse the shift to find the source coordinate
            coord[0] -= shift[0];
            coord[1] -= shift[1];
            data[coord_to_row_maj_index(coord, dims)]
        })
        .collect::<Vec<_>>();
    data.copy_from_slice(&result);
}

/// forward fft shift of a row-major 2-D array (moves DC from index 0 to the center)
pub fn fftshift2<T: Copy + Send + Sync>(dims: [usize; 2], data: &mut [T]) {
    let shift = [(dims[0] / 2) as i64, (dims[1] / 2) as i64];
    circshift2(dims, shift, data);
}

/// inverse fft shift of a row-major 2-D array
pub fn ifftshift2<T: Copy + Send + Sync>(dims: [usize; 2], data: &mut [T]) {
    let shift = [((dims[0] + 1) / 2) as i64, ((dims[1] + 1) / 2) as i64];
    circshift2(dims, shift, data);
}
