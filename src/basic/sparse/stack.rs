use nalgebra_sparse::{pattern::SparsityPattern, CscMatrix};

/// Concatenates CSC matrices along the major dimension (columns).
///
/// All matrices must share the same number of rows.
pub fn csc_hstack<T: Clone>(matrices: &[&CscMatrix<T>]) -> CscMatrix<T> {
    let nrows = matrices.first().map_or(0, |m| m.nrows());
    let mut ncols = 0;
    let mut nnz = 0;
    for mat in matrices {
        assert_eq!(
            mat.nrows(),
            nrows,
            "All matrices must have the same number of rows"
        );
        ncols += mat.ncols();
        nnz += mat.nnz();
    }

    let mut data: Vec<T> = Vec::with_capacity(nnz);
    let mut indices: Vec<usize> = Vec::with_capacity(nnz);
    let mut indptr: Vec<usize> = Vec::with_capacity(ncols + 1);
    let mut current_offset = 0;
    for mat in matrices {
        let pattern = mat.pattern();
        indptr.extend(
            pattern.major_offsets()[..mat.ncols()]
                .iter()
                .map(|x| x + current_offset),
        );
        indices.extend_from_slice(pattern.minor_indices());
        data.extend_from_slice(mat.values());
        current_offset += mat.nnz();
    }
    indptr.push(nnz);

    unsafe {
        let pattern = SparsityPattern::from_offset_and_indices_unchecked(ncols, nrows, indptr, indices);
        CscMatrix::try_from_pattern_and_values(pattern, data).unwrap_unchecked()
    }
}

/// Concatenates CSC matrices along the minor dimension (rows).
///
/// All matrices must share the same number of columns.
pub fn csc_vstack<T: Clone>(matrices: &[&CscMatrix<T>]) -> CscMatrix<T> {
    let ncols = matrices.first().map_or(0, |m| m.ncols());
    let mut nrows = 0;
    let mut nnz = 0;
    for mat in matrices {
        assert_eq!(
            mat.ncols(),
            ncols,
            "All matrices must have the same number of cols"
        );
        nrows += mat.nrows();
        nnz += mat.nnz();
    }

    let mut data: Vec<T> = Vec::with_capacity(nnz);
    let mut indices: Vec<usize> = Vec::with_capacity(nnz);
    let mut indptr: Vec<usize> = vec![0; ncols + 1];
    for j in 0..ncols {
        let mut row_offset = 0;
        let mut count = 0;
        for mat in matrices {
            let pattern = mat.pattern();
            let start = pattern.major_offsets()[j];
            let end = pattern.major_offsets()[j + 1];
            data.extend_from_slice(&mat.values()[start..end]);
            indices.extend(pattern.minor_indices()[start..end].iter().map(|x| x + row_offset));
            row_offset += mat.nrows();
            count += end - start;
        }
        indptr[j + 1] = indptr[j] + count;
    }

    unsafe {
        let pattern = SparsityPattern::from_offset_and_indices_unchecked(ncols, nrows, indptr, indices);
        CscMatrix::try_from_pattern_and_values(pattern, data).unwrap_unchecked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    #[test]
    fn test_csc_hstack() {
        let mut mat1 = CooMatrix::new(3, 2);
        mat1.push(2, 1, 3);

        let mut mat2 = CooMatrix::new(3, 3);
        mat2.push(0, 0, 2);
        mat2.push(1, 1, 4);
        mat2.push(2, 2, 6);

        let mut mat3 = CooMatrix::new(3, 5);
        mat3.push(2, 1, 3);
        mat3.push(0, 2, 2);
        mat3.push(1, 3, 4);
        mat3.push(2, 4, 6);
        let b = CscMatrix::from(&mat3);

        let a = csc_hstack(&[&CscMatrix::from(&mat1), &CscMatrix::from(&mat2)]);
        println!("hstack(a,b)={:?}", a.clone().disassemble());
        assert!(a == b, "matrices do not match!")
    }

    #[test]
    fn test_csc_vstack() {
        let mut mat1 = CooMatrix::new(2, 3);
        mat1.push(1, 2, 3);

        let mut mat2 = CooMatrix::new(3, 3);
        mat2.push(0, 0, 2);
        mat2.push(1, 1, 4);
        mat2.push(2, 2, 6);

        let mut mat3 = CooMatrix::new(5, 3);
        mat3.push(1, 2, 3);
        mat3.push(2, 0, 2);
        mat3.push(3, 1, 4);
        mat3.push(4, 2, 6);
        let b = CscMatrix::from(&mat3);

        let a = csc_vstack(&[&CscMatrix::from(&mat1), &CscMatrix::from(&mat2)]);
        println!("vstack(a,b)={:?}", a.clone().disassemble());
        assert!(a == b, "matrices do not match!")
    }

    #[test]
    fn test_empty_blocks_keep_shape() {
        let empty_rows: CscMatrix<f64> = CscMatrix::zeros(0, 4);
        let mut m = CooMatrix::new(2, 4);
        m.push(1, 3, 1.0);
        let m = CscMatrix::from(&m);
        let v = csc_vstack(&[&empty_rows, &m, &empty_rows]);
        assert!(v.nrows() == 2 && v.ncols() == 4 && v.nnz() == 1);

        let empty_cols: CscMatrix<f64> = CscMatrix::zeros(2, 0);
        let h = csc_hstack(&[&empty_cols, &m]);
        assert!(h == m);
    }
}
