use super::{
    Document, Expression, FieldUsage, MiningFunction, Model, Normalization, ResultFeature,
};
use crate::types::OpType;
use std::collections::HashMap;

impl Document {
    /// Check the structural invariants of the document.
    ///
    /// Returns a description of the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        // name -> op type of everything defined so far
        let mut scope: HashMap<&str, OpType> = HashMap::new();

        let mut target = None;
        for field in &self.data_dictionary {
            if scope.contains_key(field.name.as_str()) || target == Some(field.name.as_str()) {
                return Err(format!("duplicate field '{}'", field.name));
            }
            match field.usage {
                FieldUsage::Active => {
                    scope.insert(&field.name, field.op_type);
                }
                FieldUsage::Target => {
                    if target.is_some() {
                        return Err("more than one target field".to_string());
                    }
                    target = Some(field.name.as_str());
                }
            }
        }

        for derived in &self.derived_fields {
            check_expression(&derived.expression, &scope)
                .map_err(|e| format!("derived field '{}': {e}", derived.name))?;
            if scope.contains_key(derived.name.as_str()) || target == Some(derived.name.as_str()) {
                return Err(format!("duplicate field '{}'", derived.name));
            }
            scope.insert(&derived.name, derived.op_type);
        }

        self.check_model(&scope, target)?;

        for output in &self.outputs {
            match &output.feature {
                ResultFeature::PredictedValue => {}
                ResultFeature::Probability { value } => {
                    let Model::Regression(model) = &self.model;
                    if model.mining_function != MiningFunction::Classification {
                        return Err(format!(
                            "output '{}': probability requires a classification model",
                            output.name
                        ));
                    }
                    if !model.categories.contains(value) {
                        return Err(format!(
                            "output '{}': unknown category '{value}'",
                            output.name
                        ));
                    }
                }
                ResultFeature::Transformed { expression } => {
                    check_expression(expression, &scope)
                        .map_err(|e| format!("output '{}': {e}", output.name))?;
                }
            }
            if scope.contains_key(output.name.as_str()) {
                return Err(format!("duplicate field '{}'", output.name));
            }
            scope.insert(&output.name, output.op_type);
        }

        Ok(())
    }

    fn check_model(&self, scope: &HashMap<&str, OpType>, target: Option<&str>) -> Result<(), String> {
        let Model::Regression(model) = &self.model;
        if target != Some(model.target.as_str()) {
            return Err(format!(
                "model target '{}' is not the document's target field",
                model.target
            ));
        }
        for field in self.model.field_refs() {
            match scope.get(field) {
                None => return Err(format!("model references undefined field '{field}'")),
                Some(OpType::Categorical) => {
                    return Err(format!("model predictor '{field}' is categorical"));
                }
                Some(OpType::Continuous) => {}
            }
        }
        match model.mining_function {
            MiningFunction::Regression => {
                if model.tables.len() != 1 {
                    return Err(format!(
                        "regression needs exactly one table, found {}",
                        model.tables.len()
                    ));
                }
                if model.normalization == Normalization::Softmax {
                    return Err("softmax normalization requires classification".to_string());
                }
            }
            MiningFunction::Classification => {
                if model.tables.len() != model.categories.len() || model.categories.len() < 2 {
                    return Err(format!(
                        "classification needs one table per category ({} tables, {} categories)",
                        model.tables.len(),
                        model.categories.len()
                    ));
                }
                for table in &model.tables {
                    match &table.target_category {
                        Some(c) if model.categories.contains(c) => {}
                        other => {
                            return Err(format!("table has invalid target category {other:?}"));
                        }
                    }
                }
                if model.normalization == Normalization::Logit && model.tables.len() != 2 {
                    return Err("logit normalization requires exactly two tables".to_string());
                }
                if model.normalization == Normalization::None {
                    return Err("classification requires logit or softmax normalization".to_string());
                }
            }
        }
        Ok(())
    }
}

fn check_expression(expr: &Expression, scope: &HashMap<&str, OpType>) -> Result<(), String> {
    match expr {
        Expression::FieldRef { field } => {
            if !scope.contains_key(field.as_str()) {
                return Err(format!("reference to undefined field '{field}'"));
            }
        }
        Expression::NormDiscrete { field, .. } => match scope.get(field.as_str()) {
            None => return Err(format!("reference to undefined field '{field}'")),
            Some(OpType::Continuous) => {
                return Err(format!("norm_discrete over continuous field '{field}'"));
            }
            Some(OpType::Categorical) => {}
        },
        Expression::Constant { .. } => {}
        Expression::Apply {
            function,
            arguments,
        } => {
            if !function.accepts(arguments.len()) {
                return Err(format!(
                    "{function:?} does not accept {} arguments",
                    arguments.len()
                ));
            }
            for arg in arguments {
                check_expression(arg, scope)?;
            }
        }
    }
    Ok(())
}
